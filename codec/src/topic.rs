// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Lesser General Public License that can be found
// in the LICENSE file.

use std::fmt;

use crate::utils::validate_utf8_string;
use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, StringData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    /// Topic or filter is not a valid MQTT string.
    InvalidString,

    /// Topic name contains wildcard characters, or filter uses them in
    /// a disallowed position.
    InvalidWildcard,

    /// Topic or filter is empty where a non-empty one is required.
    EmptyTopic,
}

impl From<TopicError> for EncodeError {
    fn from(_e: TopicError) -> Self {
        Self::InvalidTopic
    }
}

impl From<TopicError> for DecodeError {
    fn from(e: TopicError) -> Self {
        match e {
            TopicError::InvalidString => Self::InvalidString,
            TopicError::InvalidWildcard => Self::InvalidTopicFilter,
            TopicError::EmptyTopic => Self::EmptyTopic,
        }
    }
}

/// A topic name used in publish packets.
///
/// Topic names MUST NOT contain the wildcard characters `+` or `#`
/// [MQTT-3.3.2-2]. An empty topic name is only valid on the wire when a
/// Topic Alias property carries the real topic, so [`PubTopic::new`]
/// rejects it while [`PubTopic::empty`] constructs it deliberately.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct PubTopic(String);

impl PubTopic {
    /// Create a new topic name from `s`.
    ///
    /// # Errors
    ///
    /// Returns error if `s` is empty, too long, or contains wildcards.
    pub fn new(s: &str) -> Result<Self, TopicError> {
        if s.is_empty() {
            return Err(TopicError::EmptyTopic);
        }
        validate_utf8_string(s).map_err(|_| TopicError::InvalidString)?;
        if s.contains(['+', '#']) {
            return Err(TopicError::InvalidWildcard);
        }
        Ok(Self(s.to_string()))
    }

    /// Create an empty topic name, to be resolved through a topic alias.
    #[must_use]
    pub const fn empty() -> Self {
        Self(String::new())
    }

    /// Returns true if topic name is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl fmt::Display for PubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let s = StringData::decode(ba)?;
        if s.is_empty() {
            // Legal only together with a Topic Alias property; the caller
            // checks that combination.
            return Ok(Self::empty());
        }
        Self::new(s.as_ref()).map_err(DecodeError::from)
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let s = StringData::from(&self.0)?;
        s.encode(buf)
    }
}

/// One level of a parsed topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FilterSegment {
    /// Normal level, compared literally. May be empty.
    Literal(String),

    /// `+` wildcard, matches exactly one level.
    SingleLevel,

    /// `#` wildcard, matches all remaining levels, including none.
    MultiLevel,
}

/// A topic filter used in subscribe and unsubscribe packets.
///
/// Wildcard rules [MQTT-4.7]:
/// - `+` matches exactly one level and must occupy an entire level.
/// - `#` matches zero or more trailing levels, must occupy an entire level,
///   and must be the last level of the filter.
/// - Filters that do not start with `$` never match topics starting
///   with `$`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct SubTopic {
    filter: String,
    segments: Vec<FilterSegment>,
}

impl SubTopic {
    /// Create a new topic filter from `s`.
    ///
    /// # Errors
    ///
    /// Returns error if `s` is empty, too long, or misplaces a wildcard.
    pub fn new(s: &str) -> Result<Self, TopicError> {
        let segments = Self::parse(s)?;
        Ok(Self {
            filter: s.to_string(),
            segments,
        })
    }

    fn parse(s: &str) -> Result<Vec<FilterSegment>, TopicError> {
        if s.is_empty() {
            return Err(TopicError::EmptyTopic);
        }
        validate_utf8_string(s).map_err(|_| TopicError::InvalidString)?;

        let levels: Vec<&str> = s.split('/').collect();
        let last = levels.len() - 1;
        let mut segments = Vec::with_capacity(levels.len());
        for (idx, level) in levels.iter().enumerate() {
            let segment = match *level {
                "+" => FilterSegment::SingleLevel,
                "#" => {
                    if idx != last {
                        return Err(TopicError::InvalidWildcard);
                    }
                    FilterSegment::MultiLevel
                }
                literal => {
                    if literal.contains(['+', '#']) {
                        return Err(TopicError::InvalidWildcard);
                    }
                    FilterSegment::Literal((*literal).to_string())
                }
            };
            segments.push(segment);
        }
        Ok(segments)
    }

    /// Check whether `topic` matches this filter.
    #[must_use]
    pub fn is_match(&self, topic: &str) -> bool {
        // Filters not starting with `$` never match `$`-topics, so that
        // subscriptions like `#` do not receive server internal messages.
        if topic.starts_with('$') && !self.filter.starts_with('$') {
            return false;
        }

        let levels: Vec<&str> = topic.split('/').collect();

        let mut level_iter = levels.iter();
        for segment in &self.segments {
            match segment {
                // `#` includes the parent level, so `sport/#` also matches
                // the topic `sport` [MQTT-4.7.1-1].
                FilterSegment::MultiLevel => return true,
                FilterSegment::SingleLevel => {
                    if level_iter.next().is_none() {
                        return false;
                    }
                }
                FilterSegment::Literal(literal) => match level_iter.next() {
                    Some(level) if level == literal => (),
                    _ => return false,
                },
            }
        }

        level_iter.len() == 0
    }

    /// Get byte length in packet.
    #[must_use]
    pub fn bytes(&self) -> usize {
        2 + self.filter.len()
    }
}

impl fmt::Display for SubTopic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.filter)
    }
}

impl AsRef<str> for SubTopic {
    fn as_ref(&self) -> &str {
        &self.filter
    }
}

impl DecodePacket for SubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let s = StringData::decode(ba)?;
        Self::new(s.as_ref()).map_err(DecodeError::from)
    }
}

impl EncodePacket for SubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let s = StringData::from(&self.filter)?;
        s.encode(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pub_topic_rejects_wildcards() {
        assert!(PubTopic::new("sport/tennis").is_ok());
        assert_eq!(PubTopic::new(""), Err(TopicError::EmptyTopic));
        assert_eq!(
            PubTopic::new("sport/+"),
            Err(TopicError::InvalidWildcard)
        );
        assert_eq!(PubTopic::new("sport/#"), Err(TopicError::InvalidWildcard));
    }

    #[test]
    fn test_sub_topic_validation() {
        assert!(SubTopic::new("sport/tennis/+").is_ok());
        assert!(SubTopic::new("#").is_ok());
        assert!(SubTopic::new("sport/#").is_ok());
        assert!(SubTopic::new("+/+/+").is_ok());

        assert_eq!(SubTopic::new("sport+"), Err(TopicError::InvalidWildcard));
        assert_eq!(
            SubTopic::new("sport/tennis#"),
            Err(TopicError::InvalidWildcard)
        );
        assert_eq!(
            SubTopic::new("sport/tennis/#/ranking"),
            Err(TopicError::InvalidWildcard)
        );
        assert_eq!(SubTopic::new("/#/"), Err(TopicError::InvalidWildcard));
        assert_eq!(SubTopic::new(""), Err(TopicError::EmptyTopic));
    }

    #[test]
    fn test_single_level_wildcard() {
        let filter = SubTopic::new("sport/tennis/+").unwrap();
        assert!(filter.is_match("sport/tennis/player1"));
        assert!(filter.is_match("sport/tennis/"));
        assert!(!filter.is_match("sport/tennis/player1/ranking"));
        assert!(!filter.is_match("sport/tennis"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let filter = SubTopic::new("sport/#").unwrap();
        assert!(filter.is_match("sport"));
        assert!(filter.is_match("sport/tennis"));
        assert!(filter.is_match("sport/x/y"));
        assert!(!filter.is_match("other/tennis"));

        let filter = SubTopic::new("#").unwrap();
        assert!(filter.is_match("sport"));
        assert!(filter.is_match("sport/tennis/player1"));
    }

    #[test]
    fn test_dollar_topics() {
        let filter = SubTopic::new("+/monitor/Clients").unwrap();
        assert!(!filter.is_match("$SYS/monitor/Clients"));

        let filter = SubTopic::new("#").unwrap();
        assert!(!filter.is_match("$SYS/monitor/Clients"));

        let filter = SubTopic::new("$SYS/monitor/+").unwrap();
        assert!(filter.is_match("$SYS/monitor/Clients"));

        let filter = SubTopic::new("$SYS/#").unwrap();
        assert!(filter.is_match("$SYS/monitor/Clients"));
    }

    #[test]
    fn test_literal_match() {
        let filter = SubTopic::new("sport/tennis").unwrap();
        assert!(filter.is_match("sport/tennis"));
        assert!(!filter.is_match("sport/tennis/player1"));
        assert!(!filter.is_match("sport"));
    }
}
