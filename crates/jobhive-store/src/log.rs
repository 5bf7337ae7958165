use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use jobhive_common::{JobError, JobId, Result, time::now};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};

use crate::layout::JobPaths;

const TAIL_CHUNK_SIZE: u64 = 8 * 1024;
const COUNT_CHUNK_SIZE: usize = 64 * 1024;
const NOTE_PREFIX: &str = "[jobhive]";

/// Append-only per-job logs that can be tailed while a writer is active.
#[derive(Debug, Clone)]
pub struct LogSink {
    root: PathBuf,
}

impl LogSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn append(&self, id: &JobId, bytes: &[u8]) -> Result<()> {
        let mut file = self.open_for_append(id).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// Appends a timestamped lifecycle line written by the manager itself.
    pub async fn note(&self, id: &JobId, message: &str) -> Result<()> {
        let line = format!(
            "{NOTE_PREFIX} {} {message}\n",
            now().format("%Y-%m-%dT%H:%M:%S%.3fZ")
        );
        self.append(id, line.as_bytes()).await
    }

    /// Shared writer for a process's stdout and stderr pumps.
    pub async fn writer(&self, id: &JobId) -> Result<LogWriter> {
        let file = self.open_for_append(id).await?;
        Ok(LogWriter {
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Last `n` lines in write order; `n == 0` returns the whole log.
    pub async fn tail(&self, id: &JobId, n: usize) -> Result<Vec<String>> {
        let path = self.log_path(id)?;
        if n == 0 {
            let bytes = fs::read(&path)
                .await
                .map_err(|err| map_log_io_error(id, err))?;
            return Ok(split_lines(trim_final_newline(&bytes), usize::MAX));
        }

        let file = File::open(&path)
            .await
            .map_err(|err| map_log_io_error(id, err))?;
        let bytes = read_tail_bytes(file, n).await?;
        Ok(split_lines(trim_final_newline(&bytes), n))
    }

    /// Number of lines `tail(id, 0)` would return.
    pub async fn line_count(&self, id: &JobId) -> Result<usize> {
        let path = self.log_path(id)?;
        let mut file = File::open(&path)
            .await
            .map_err(|err| map_log_io_error(id, err))?;

        let mut chunk = vec![0u8; COUNT_CHUNK_SIZE];
        let mut lines = 0usize;
        let mut last = None;
        loop {
            let read = file.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            lines += memchr::memchr_iter(b'\n', &chunk[..read]).count();
            last = Some(chunk[read - 1]);
        }

        // An unterminated final line still counts.
        if last.is_some_and(|byte| byte != b'\n') {
            lines += 1;
        }
        Ok(lines)
    }

    async fn open_for_append(&self, id: &JobId) -> Result<File> {
        let path = self.log_path(id)?;
        OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|err| map_log_io_error(id, err))
    }

    fn log_path(&self, id: &JobId) -> Result<PathBuf> {
        if !id.is_well_formed() {
            return Err(JobError::NotFound(id.clone()));
        }
        Ok(JobPaths::new(&self.root, id).log)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Writes whole lines so concurrent pumps never interleave mid-line.
#[derive(Debug, Clone)]
pub struct LogWriter {
    file: Arc<Mutex<File>>,
}

impl LogWriter {
    pub async fn write_line(&self, line: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        if !line.ends_with(b"\n") {
            buf.push(b'\n');
        }

        // One append per line; notes use their own handle.
        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Reads backwards from the end until `n` complete lines are buffered.
async fn read_tail_bytes(mut file: File, n: usize) -> Result<Vec<u8>> {
    let len = file.metadata().await?.len();
    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();
    let mut newlines = 0usize;

    while pos > 0 {
        let start = pos.saturating_sub(TAIL_CHUNK_SIZE);
        let mut chunk = vec![0u8; (pos - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut chunk).await?;

        let counted = if pos == len {
            trim_final_newline(&chunk)
        } else {
            &chunk[..]
        };
        newlines += memchr::memchr_iter(b'\n', counted).count();

        chunk.extend_from_slice(&buf);
        buf = chunk;
        pos = start;

        // Every line after a newline is complete; the first one may not be.
        if newlines >= n {
            break;
        }
    }

    Ok(buf)
}

fn trim_final_newline(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(b"\n").unwrap_or(bytes)
}

fn split_lines(bytes: &[u8], n: usize) -> Vec<String> {
    if bytes.is_empty() {
        return Vec::new();
    }
    let lines: Vec<&[u8]> = bytes.split(|byte| *byte == b'\n').collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..]
        .iter()
        .map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            String::from_utf8_lossy(line).into_owned()
        })
        .collect()
}

fn map_log_io_error(id: &JobId, err: std::io::Error) -> JobError {
    if err.kind() == std::io::ErrorKind::NotFound {
        JobError::NotFound(id.clone())
    } else {
        JobError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn sink_with_job(dir: &TempDir, id: &JobId) -> LogSink {
        let paths = JobPaths::new(dir.path(), id);
        fs::create_dir_all(&paths.dir).await.unwrap();
        File::create(&paths.log).await.unwrap();
        LogSink::new(dir.path())
    }

    #[tokio::test]
    async fn tail_returns_last_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let id = JobId::from("job");
        let sink = sink_with_job(&dir, &id).await;

        for index in 1..=5 {
            sink.append(&id, format!("line {index}\n").as_bytes())
                .await
                .unwrap();
        }

        assert_eq!(sink.tail(&id, 2).await.unwrap(), vec!["line 4", "line 5"]);
        assert_eq!(sink.tail(&id, 50).await.unwrap().len(), 5);
        assert_eq!(sink.tail(&id, 0).await.unwrap().len(), 5);
        assert_eq!(sink.line_count(&id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn tail_spans_chunk_boundaries() {
        let dir = TempDir::new().unwrap();
        let id = JobId::from("job");
        let sink = sink_with_job(&dir, &id).await;

        let mut payload = String::new();
        for index in 0..5000 {
            payload.push_str(&format!("{index:06} {}\n", "x".repeat(20)));
        }
        sink.append(&id, payload.as_bytes()).await.unwrap();

        let lines = sink.tail(&id, 1200).await.unwrap();
        assert_eq!(lines.len(), 1200);
        assert!(lines[0].starts_with("003800 "));
        assert!(lines[1199].starts_with("004999 "));
    }

    #[tokio::test]
    async fn tail_handles_missing_trailing_newline_and_crlf() {
        let dir = TempDir::new().unwrap();
        let id = JobId::from("job");
        let sink = sink_with_job(&dir, &id).await;

        sink.append(&id, b"first\r\nsecond\r\nthird").await.unwrap();
        assert_eq!(sink.tail(&id, 2).await.unwrap(), vec!["second", "third"]);
        assert_eq!(sink.line_count(&id).await.unwrap(), 3);

        sink.append(&id, b"\n\n").await.unwrap();
        assert_eq!(
            sink.line_count(&id).await.unwrap(),
            sink.tail(&id, 0).await.unwrap().len()
        );
    }

    #[tokio::test]
    async fn line_count_spans_chunks() {
        let dir = TempDir::new().unwrap();
        let id = JobId::from("job");
        let sink = sink_with_job(&dir, &id).await;

        let payload = "y".repeat(99) + "\n";
        sink.append(&id, payload.repeat(3000).as_bytes()).await.unwrap();
        assert_eq!(sink.line_count(&id).await.unwrap(), 3000);
    }

    #[tokio::test]
    async fn empty_log_has_no_lines() {
        let dir = TempDir::new().unwrap();
        let id = JobId::from("job");
        let sink = sink_with_job(&dir, &id).await;
        assert!(sink.tail(&id, 10).await.unwrap().is_empty());
        assert!(sink.tail(&id, 0).await.unwrap().is_empty());
        assert_eq!(sink.line_count(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let dir = TempDir::new().unwrap();
        let sink = LogSink::new(dir.path());
        assert!(matches!(
            sink.tail(&JobId::from("nope"), 5).await,
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            sink.append(&JobId::from("nope"), b"x").await,
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            sink.line_count(&JobId::from("nope")).await,
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            sink.tail(&JobId::from("../escape"), 5).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn notes_are_prefixed() {
        let dir = TempDir::new().unwrap();
        let id = JobId::from("job");
        let sink = sink_with_job(&dir, &id).await;
        sink.note(&id, "launched pid 42").await.unwrap();
        let lines = sink.tail(&id, 1).await.unwrap();
        assert!(lines[0].starts_with("[jobhive] "));
        assert!(lines[0].ends_with("launched pid 42"));
    }

    #[tokio::test]
    async fn tail_is_consistent_while_writer_appends() {
        let dir = TempDir::new().unwrap();
        let id = JobId::from("job");
        let sink = sink_with_job(&dir, &id).await;
        let writer = sink.writer(&id).await.unwrap();

        let producer = tokio::spawn(async move {
            for index in 0..2000 {
                writer
                    .write_line(format!("{index:05}").as_bytes())
                    .await
                    .unwrap();
            }
        });

        for _ in 0..50 {
            let lines = sink.tail(&id, 10).await.unwrap();
            assert!(lines.len() <= 10);
            let numbers: Vec<u32> = lines
                .iter()
                .filter(|line| line.len() == 5)
                .map(|line| line.parse().unwrap())
                .collect();
            assert!(numbers.windows(2).all(|pair| pair[0] + 1 == pair[1]));
            tokio::task::yield_now().await;
        }

        producer.await.unwrap();
        let lines = sink.tail(&id, 3).await.unwrap();
        assert_eq!(lines, vec!["01997", "01998", "01999"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notes_never_split_writer_lines() {
        let dir = TempDir::new().unwrap();
        let id = JobId::from("job");
        let sink = sink_with_job(&dir, &id).await;
        let writer = sink.writer(&id).await.unwrap();

        let producer = tokio::spawn(async move {
            for index in 0..500 {
                writer
                    .write_line(format!("out-{index:05}").as_bytes())
                    .await
                    .unwrap();
            }
        });
        let notes = {
            let sink = sink.clone();
            let id = id.clone();
            tokio::spawn(async move {
                for index in 0..200 {
                    sink.note(&id, &format!("note {index}")).await.unwrap();
                }
            })
        };
        producer.await.unwrap();
        notes.await.unwrap();

        let lines = sink.tail(&id, 0).await.unwrap();
        assert_eq!(lines.len(), 700);
        let outputs = lines.iter().filter(|line| line.starts_with("out-")).count();
        let prefixed = lines.iter().filter(|line| line.starts_with("[jobhive] ")).count();
        assert_eq!((outputs, prefixed), (500, 200));
        for line in lines.iter().filter(|line| line.starts_with("out-")) {
            assert_eq!(line.len(), "out-00000".len(), "{line:?}");
        }
    }
}
