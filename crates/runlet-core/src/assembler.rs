//! Assembly of raw output events into the framed chunk stream.
//!
//! The assembler is a small state machine over one execution's output:
//! `Before` until the first fragment arrives, `InConsole` while output
//! flows, done once a terminal sentinel (or the end of the stream)
//! closes the frame. Fragments are buffered per stream and only complete
//! lines are classified, so a marker split across two reads can never leak
//! into user-visible text; partial trailing lines are flushed when the
//! execution ends.

use async_stream::stream;
use runlet_chunks::Chunk;

use crate::controller::ChunkStream;
use crate::errors::EngineError;
use crate::markers::{MarkerToken, Sentinel};
use crate::output::StreamOrigin;
use crate::sessions::OutputEvents;

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Before,
    InConsole,
}

/// Converts one execution's [`OutputEvents`] into framed chunks.
pub struct ChunkAssembler {
    token: MarkerToken,
    language: String,
}

impl ChunkAssembler {
    pub fn new(token: MarkerToken, language: impl Into<String>) -> Self {
        Self {
            token,
            language: language.into(),
        }
    }

    /// Consume the event stream and produce the chunk stream.
    ///
    /// Every execution yields exactly one `console start` and one
    /// `console end`; an `error` chunk, when present, appears immediately
    /// before the end chunk.
    pub fn into_chunks(self, mut events: OutputEvents) -> ChunkStream {
        Box::pin(stream! {
            let token = self.token;
            let language = self.language;
            let mut phase = Phase::Before;
            let mut stdout_buf = String::new();
            let mut stderr_buf = String::new();
            let mut captured_stderr = String::new();
            let mut outcome: Option<Sentinel> = None;

            'events: while let Some(event) = events.recv().await {
                if phase == Phase::Before {
                    yield Chunk::console_start();
                    phase = Phase::InConsole;
                }

                let from_stderr = event.origin == StreamOrigin::Stderr;
                let buffer = if from_stderr { &mut stderr_buf } else { &mut stdout_buf };
                buffer.push_str(&event.text);

                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    let content = &line[..line.len() - 1];
                    let (cleaned, sentinels) = token.extract(content);

                    if sentinels.is_empty() {
                        if from_stderr {
                            captured_stderr.push_str(&line);
                        }
                        yield Chunk::console(line);
                        continue;
                    }

                    // Genuine text sharing a line with a sentinel keeps its
                    // own bytes; the newline belonged to the sentinel print.
                    if !cleaned.is_empty() {
                        if from_stderr {
                            captured_stderr.push_str(&cleaned);
                        }
                        yield Chunk::console(cleaned);
                    }
                    for sentinel in sentinels {
                        match sentinel {
                            Sentinel::ActiveLine(number) => yield Chunk::active_line(number),
                            terminal => {
                                outcome = Some(terminal);
                                break 'events;
                            }
                        }
                    }
                }
            }

            if phase == Phase::Before {
                yield Chunk::console_start();
            }

            // Trailing output that never saw a newline.
            let (cleaned, _) = token.extract(&stdout_buf);
            if !cleaned.is_empty() {
                yield Chunk::console(cleaned);
            }
            let (cleaned, _) = token.extract(&stderr_buf);
            if !cleaned.is_empty() {
                captured_stderr.push_str(&cleaned);
                yield Chunk::console(cleaned);
            }

            match outcome {
                Some(Sentinel::Done) => {}
                Some(_) => {
                    let detail = captured_stderr.trim_end();
                    let text = if detail.is_empty() {
                        "Your code raised an error.".to_string()
                    } else {
                        EngineError::ExecutionRuntimeError(detail.to_string()).chunk_text()
                    };
                    yield Chunk::error(text);
                }
                None => {
                    let mut text = EngineError::ProcessCrashed {
                        language,
                        message: "the runtime exited before finishing".to_string(),
                    }
                    .chunk_text();
                    let detail = captured_stderr.trim_end();
                    if !detail.is_empty() {
                        text.push_str("\n");
                        text.push_str(detail);
                    }
                    yield Chunk::error(text);
                }
            }

            yield Chunk::console_end();
        })
    }
}
