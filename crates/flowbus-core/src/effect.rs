//! Error classification shared by every capability error.

/// Whether retrying the same input may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retrying with the same input will fail again.
    Permanent,
    /// A log client timeout or an unavailable store; retry with the same input.
    Retryable,
    /// Not known.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What is known about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// No state was changed and nothing was published.
    None,
    /// State changed or records were published before the failure.
    Some,
    /// Not known.
    Unknown,
}

enum_str! {
    Effect {
        None => ["none"],
        Some => ["some"],
        Unknown => ["unknown"],
    }
}

enum_str! {
    Transience {
        Permanent => ["permanent"],
        Retryable => ["retryable"],
        Unknown => ["unknown"],
    }
}
