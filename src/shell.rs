//! Demonstration console for `shell` requests.
//!
//! A line editor that echoes input, answers every completed line with
//! `Unknown command: <line>` and re-prompts. Nothing is executed.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{Channel, ChannelInput};
use crate::config::ShellConfig;

const CR: u8 = b'\r';

/// Down-arrow as sent by PuTTY-style terminals; echoed back untouched.
const KEEPALIVE: [u8; 3] = [0x1b, b'[', b'B'];

/// Per-channel line buffer.
#[derive(Debug)]
pub struct LineEditor {
    prompt: String,
    echo: bool,
    line: String,
}

impl LineEditor {
    pub fn new(config: &ShellConfig) -> Self {
        Self {
            prompt: config.prompt.clone(),
            echo: config.echo,
            line: String::new(),
        }
    }

    /// Banner and first prompt.
    pub fn greeting(config: &ShellConfig) -> Vec<u8> {
        format!("{}\r\n{}", config.banner, config.prompt).into_bytes()
    }

    pub fn buffered(&self) -> &str {
        &self.line
    }

    /// Feed one inbound chunk, returning the chunks to send back in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let Some(&last) = chunk.last() else {
            return out;
        };

        if chunk.starts_with(&KEEPALIVE) {
            out.push(KEEPALIVE.to_vec());
            return out;
        }

        if self.echo {
            out.push(chunk.to_vec());
        }
        self.line.push_str(&String::from_utf8_lossy(chunk));

        if chunk == [CR] && self.line.len() == 1 {
            out.push(format!("\r\n{}", self.prompt).into_bytes());
            self.line.clear();
            return out;
        }
        if last != CR {
            return out;
        }

        // The reply reports the command without its line terminator.
        let command = self.line.trim_end_matches(['\r', '\n']);
        out.push(format!("\r\nUnknown command: {command}\r\n").into_bytes());
        out.push(self.prompt.clone().into_bytes());
        self.line.clear();
        out
    }
}

/// Drive the console for one channel until its input ends.
pub(crate) fn spawn_shell(
    channel: Arc<Channel>,
    mut input: mpsc::UnboundedReceiver<ChannelInput>,
    config: ShellConfig,
) {
    tokio::spawn(async move {
        let id = channel.server_channel_id();
        if let Err(e) = channel.send_data(&LineEditor::greeting(&config)).await {
            debug!("Shell on channel {} ended before greeting: {}", id, e);
            return;
        }

        let mut editor = LineEditor::new(&config);
        while let Some(item) = input.recv().await {
            let ChannelInput::Data(bytes) = item else {
                debug!("Shell on channel {} got EOF", id);
                continue;
            };
            for reply in editor.feed(&bytes) {
                if let Err(e) = channel.send_data(&reply).await {
                    debug!("Shell on channel {} stopped: {}", id, e);
                    return;
                }
            }
        }
        debug!("Shell on channel {} finished", id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor(echo: bool) -> LineEditor {
        LineEditor::new(&ShellConfig {
            echo,
            ..ShellConfig::default()
        })
    }

    #[test]
    fn test_greeting() {
        assert_eq!(
            LineEditor::greeting(&ShellConfig::default()),
            b"VC-4 Control Console\r\nVC-4>".to_vec()
        );
    }

    #[test]
    fn test_empty_line_resends_prompt() {
        let mut ed = editor(false);
        assert_eq!(ed.feed(b"\r"), vec![b"\r\nVC-4>".to_vec()]);
        assert_eq!(ed.buffered(), "");

        let mut ed = editor(true);
        assert_eq!(ed.feed(b"\r"), vec![b"\r".to_vec(), b"\r\nVC-4>".to_vec()]);
        assert_eq!(ed.buffered(), "");
    }

    #[test]
    fn test_typed_line_is_unknown_command() {
        let mut ed = editor(true);
        assert_eq!(ed.feed(b"l"), vec![b"l".to_vec()]);
        assert_eq!(ed.feed(b"s"), vec![b"s".to_vec()]);
        assert_eq!(ed.buffered(), "ls");
        assert_eq!(
            ed.feed(b"\r"),
            vec![
                b"\r".to_vec(),
                b"\r\nUnknown command: ls\r\n".to_vec(),
                b"VC-4>".to_vec(),
            ]
        );
        assert_eq!(ed.buffered(), "");
    }

    #[test]
    fn test_whole_line_in_one_chunk() {
        let mut ed = editor(false);
        assert_eq!(
            ed.feed(b"status\r"),
            vec![
                b"\r\nUnknown command: status\r\n".to_vec(),
                b"VC-4>".to_vec()
            ]
        );
    }

    #[test]
    fn test_keepalive_is_echoed_not_buffered() {
        let mut ed = editor(true);
        ed.feed(b"a");
        assert_eq!(ed.feed(&KEEPALIVE), vec![KEEPALIVE.to_vec()]);
        assert_eq!(ed.buffered(), "a");
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut ed = editor(true);
        assert!(ed.feed(b"").is_empty());
    }

    #[test]
    fn test_reported_command_excludes_line_terminators() {
        let mut ed = editor(false);
        assert!(ed.feed(b"ls\n").is_empty());
        assert_eq!(
            ed.feed(b"\r"),
            vec![b"\r\nUnknown command: ls\r\n".to_vec(), b"VC-4>".to_vec()]
        );
    }

    #[test]
    fn test_lone_cr_after_text_completes_line() {
        let mut ed = editor(false);
        ed.feed(b"x");
        assert_eq!(
            ed.feed(b"\r"),
            vec![b"\r\nUnknown command: x\r\n".to_vec(), b"VC-4>".to_vec()]
        );
    }
}
