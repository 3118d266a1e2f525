//! NDJSON-backed product source.
//!
//! One file per website, one `ProductJob` object per line. Used by the
//! ingest binary for replaying captured scrapes and by tests as a cheap
//! real source. Malformed lines are skipped with a warning; an I/O failure
//! is a stream-level error and aborts the run.

use std::path::PathBuf;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::warn;

use super::{ProductJob, ProductSource, ScrapeError};

pub struct NdjsonSource {
    name: String,
    website_id: i64,
    path: PathBuf,
}

impl NdjsonSource {
    pub fn new(name: impl Into<String>, website_id: i64, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            website_id,
            path: path.into(),
        }
    }
}

enum ReadState {
    Init(PathBuf),
    Reading(Lines<BufReader<File>>),
    Done,
}

impl ProductSource for NdjsonSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn website_id(&self) -> i64 {
        self.website_id
    }

    fn stream(&self) -> BoxStream<'_, Result<ProductJob, ScrapeError>> {
        let website_id = self.website_id;
        let source = self.name.clone();
        futures::stream::unfold(ReadState::Init(self.path.clone()), move |mut state| {
            let source = source.clone();
            async move {
                loop {
                    match state {
                        ReadState::Init(path) => match File::open(&path).await {
                            Ok(file) => {
                                state = ReadState::Reading(BufReader::new(file).lines());
                            }
                            Err(err) => {
                                return Some((Err(ScrapeError::Io(err)), ReadState::Done));
                            }
                        },
                        ReadState::Reading(mut lines) => match lines.next_line().await {
                            Ok(Some(line)) => {
                                let trimmed = line.trim();
                                if trimmed.is_empty() {
                                    state = ReadState::Reading(lines);
                                    continue;
                                }
                                match serde_json::from_str::<ProductJob>(trimmed) {
                                    Ok(mut job) => {
                                        job.website_id = website_id;
                                        return Some((Ok(job), ReadState::Reading(lines)));
                                    }
                                    Err(err) => {
                                        warn!(%source, error = %err, "skipping malformed ndjson line");
                                        state = ReadState::Reading(lines);
                                    }
                                }
                            }
                            Ok(None) => return None,
                            Err(err) => {
                                return Some((Err(ScrapeError::Io(err)), ReadState::Done));
                            }
                        },
                        ReadState::Done => return None,
                    }
                }
            }
        })
        .boxed()
    }
}
