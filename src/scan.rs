//! Scan-cycle state machine.
//!
//! One activation of the capture device runs Idle -> Scanning -> Resolving ->
//! a terminal outcome -> Idle. Continuous capture hardware fires repeatedly
//! for the same physical code, so only the first capture of a cycle is
//! consumed; the rest are reported back as not accepted.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Resolving,
    Recorded,
    NotFound,
    Error,
}

impl ScanState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Resolving => "resolving",
            Self::Recorded => "recorded",
            Self::NotFound => "notFound",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Recorded | Self::NotFound | Self::Error)
    }
}

#[derive(Debug)]
pub struct ScanCycle {
    state: ScanState,
    captured_code: Option<String>,
}

impl ScanCycle {
    pub fn new() -> Self {
        Self {
            state: ScanState::Idle,
            captured_code: None,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Begin a new cycle. Allowed from Idle or any terminal state (starting
    /// over after an outcome implies a reset). Returns false while a cycle
    /// is still in flight.
    pub fn start(&mut self) -> bool {
        if self.state == ScanState::Idle || self.state.is_terminal() {
            self.state = ScanState::Scanning;
            self.captured_code = None;
            true
        } else {
            false
        }
    }

    /// Consume a captured code. First one wins: only accepted while
    /// Scanning, and acceptance moves the cycle to Resolving so every
    /// further capture until reset is ignored.
    pub fn capture(&mut self, code: &str) -> bool {
        if self.state != ScanState::Scanning {
            return false;
        }
        self.state = ScanState::Resolving;
        self.captured_code = Some(code.to_string());
        true
    }

    /// Settle the in-flight cycle with its terminal outcome.
    pub fn finish(&mut self, outcome: ScanState) {
        debug_assert!(outcome.is_terminal());
        if self.state == ScanState::Resolving {
            self.state = outcome;
        }
    }

    pub fn reset(&mut self) {
        self.state = ScanState::Idle;
        self.captured_code = None;
    }

    #[allow(dead_code)]
    pub fn captured_code(&self) -> Option<&str> {
        self.captured_code.as_deref()
    }
}
