use super::{FilterBank, FilterMode, SectionBounds};
use crate::error::{AutomotiveError, Result};

/// In-memory filter RAM for testing
#[derive(Debug)]
pub struct MockFilterBank {
    mode: FilterMode,
    words: Vec<u32>,
    bounds: SectionBounds,
    writes: usize,
    writes_while_active: usize,
    fail_writes: bool,
}

impl MockFilterBank {
    /// Starts in bypass, as the peripheral does after reset
    pub fn new() -> Self {
        Self {
            mode: FilterMode::Bypass,
            words: Vec::new(),
            bounds: SectionBounds::default(),
            writes: 0,
            writes_while_active: 0,
            fail_writes: false,
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn bounds(&self) -> SectionBounds {
        self.bounds
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Table writes that happened with filtering live; always a bug
    pub fn writes_while_active(&self) -> usize {
        self.writes_while_active
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }
}

impl Default for MockFilterBank {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterBank for MockFilterBank {
    fn mode(&self) -> FilterMode {
        self.mode
    }

    fn set_mode(&mut self, mode: FilterMode) {
        self.mode = mode;
    }

    fn write_table(&mut self, words: &[u32], bounds: &SectionBounds) -> Result<()> {
        if self.fail_writes {
            return Err(AutomotiveError::LinkError("filter RAM write failed".into()));
        }
        if self.mode == FilterMode::Active {
            self.writes_while_active += 1;
        }
        self.writes += 1;
        self.words = words.to_vec();
        self.bounds = *bounds;
        Ok(())
    }
}
