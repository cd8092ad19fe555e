use anyhow::Result;
use std::future::Future;
use std::pin::Pin;

type Teardown = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// LIFO teardown stack. Disposal runs every registered cleanup in reverse
/// order on every exit path; failures are collected instead of aborting the
/// remaining cleanups, then surfaced as one aggregated error.
#[derive(Default)]
pub struct Disposer {
    stack: Vec<(String, Teardown)>,
}

impl Disposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, name: impl Into<String>, teardown: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.stack.push((name.into(), Box::pin(teardown)));
    }

    pub async fn dispose(mut self) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();
        while let Some((name, teardown)) = self.stack.pop() {
            if let Err(err) = teardown.await {
                tracing::warn!(resource = %name, err = format!("{err:#}"), "teardown failed");
                failures.push(format!("{name}: {err:#}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("teardown failed for {}", failures.join("; "))
        }
    }
}
