//! Fixed-capacity display strings.
//!
//! Topic text and setter identity have protocol-wide length limits. Values
//! are truncated when written, never when read, and truncation always lands
//! on a UTF-8 character boundary.

use std::fmt;

/// Maximum topic length in bytes.
pub const TOPIC_LEN: usize = 160;
/// Maximum nickname length in bytes.
pub const NICK_LEN: usize = 15;
/// Maximum username length in bytes.
pub const USER_LEN: usize = 10;
/// Maximum hostname length in bytes.
pub const HOST_LEN: usize = 63;
/// Room for `nick!user@host` plus separators.
pub const SETTER_LEN: usize = NICK_LEN + USER_LEN + HOST_LEN + 3;

/// A string that never holds more than `MAX` bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BoundedString<const MAX: usize>(String);

pub type TopicText = BoundedString<TOPIC_LEN>;
pub type SetterDisplay = BoundedString<SETTER_LEN>;
pub type Nick = BoundedString<NICK_LEN>;

impl<const MAX: usize> BoundedString<MAX> {
    pub fn new(value: &str) -> Self {
        Self(truncate(value, MAX).to_string())
    }

    pub fn set(&mut self, value: &str) {
        self.0.clear();
        self.0.push_str(truncate(value, MAX));
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub const fn capacity() -> usize {
        MAX
    }
}

/// Longest prefix of `value` that fits in `max` bytes without splitting a character.
pub fn truncate(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

impl<const MAX: usize> fmt::Display for BoundedString<MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<const MAX: usize> AsRef<str> for BoundedString<MAX> {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<const MAX: usize> PartialEq<str> for BoundedString<MAX> {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl<const MAX: usize> PartialEq<&str> for BoundedString<MAX> {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
