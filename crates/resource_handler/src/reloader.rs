use smol_str::SmolStr;

/// A resigned resource's resume callback.
pub struct Reloader {
    url: SmolStr,
    run: Box<dyn FnOnce()>,
}

impl Reloader {
    pub fn new(url: SmolStr, run: Box<dyn FnOnce()>) -> Self {
        Self { url, run }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn run(self) {
        (self.run)()
    }
}

impl std::fmt::Debug for Reloader {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Reloader")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct ReloaderQueue {
    entries: Vec<Reloader>,
}

impl ReloaderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reloader: Reloader) {
        self.entries.push(reloader);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn urls(&self) -> Vec<SmolStr> {
        self.entries.iter().map(|entry| entry.url.clone()).collect()
    }

    /// Move every queued reloader out, leaving the queue empty.
    pub fn take_all(&mut self) -> Vec<Reloader> {
        std::mem::take(&mut self.entries)
    }
}
