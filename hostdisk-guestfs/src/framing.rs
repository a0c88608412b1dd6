// SPDX-License-Identifier: GPL-3.0-only

//! Response framing for the guestfish line protocol
//!
//! Every command is written followed by an empty line. guestfish echoes
//! each input line after its prompt, so a response looks like:
//!
//! ```text
//! ><fs> list-filesystems      <- echo of the command
//! /dev/sda1: ext4              <- payload
//! ><fs>                        <- echo of the empty line, response complete
//! ```

use tracing::trace;

/// Remove CSI escape sequences and carriage returns
pub fn strip_terminal_noise(line: &str) -> String {
    let mut clean = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => {
                if chars.peek() == Some(&'[') {
                    chars.next();
                    // parameters until the final byte
                    for c in chars.by_ref() {
                        if ('\u{40}'..='\u{7e}').contains(&c) {
                            break;
                        }
                    }
                } else {
                    chars.next();
                }
            }
            '\r' => {}
            _ => clean.push(c),
        }
    }
    clean
}

/// Collects the payload of one response
#[derive(Debug)]
pub struct ResponseFramer<'a> {
    prompt: &'a str,
    prompts_seen: usize,
    payload: Vec<String>,
}

impl<'a> ResponseFramer<'a> {
    pub fn new(prompt: &'a str) -> Self {
        Self {
            prompt,
            prompts_seen: 0,
            payload: Vec::new(),
        }
    }

    /// Feed one stdout line; returns the payload once the response is complete
    pub fn push(&mut self, raw: &str) -> Option<Vec<String>> {
        let line = strip_terminal_noise(raw);
        if line.starts_with(self.prompt) {
            self.prompts_seen += 1;
            if self.prompts_seen == 2 {
                return Some(std::mem::take(&mut self.payload));
            }
            return None;
        }

        if self.prompts_seen == 0 {
            trace!(line = %line, "discarding output before command echo");
            return None;
        }
        self.payload.push(line);
        None
    }
}
