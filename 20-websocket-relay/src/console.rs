use std::{fmt, io, pin::Pin, sync::Arc};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

type Writer = Pin<Box<dyn AsyncWrite + Send>>;

/// Shared line writer for console output.
///
/// Clones write to the same destination and never interleave within a line.
#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Writer>>,
}

impl Console {
    pub fn stdout() -> Self {
        Self::from_writer(tokio::io::stdout())
    }

    pub fn stderr() -> Self {
        Self::from_writer(tokio::io::stderr())
    }

    pub fn from_writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            out: Arc::new(Mutex::new(Box::pin(writer))),
        }
    }

    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}
