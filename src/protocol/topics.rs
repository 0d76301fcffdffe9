//! Topic name validation and subscription filter matching
//!
//! Publish topics are concrete level paths. Subscription filters may use
//! `+` for exactly one level and `#` for the remaining levels.

use thiserror::Error;

/// Longest topic the MQTT length prefix can encode
pub const MAX_TOPIC_LEN: usize = 65_535;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic cannot be empty")]
    Empty,
    #[error("topic exceeds 65535 bytes ({0} bytes)")]
    TooLong(usize),
    #[error("topic contains a null character")]
    NullCharacter,
    #[error("publish topic cannot contain wildcards: {0}")]
    WildcardInPublish(String),
    #[error("'+' must occupy an entire level: {0}")]
    InvalidSingleLevelWildcard(String),
    #[error("'#' must be the last level and occupy it entirely: {0}")]
    InvalidMultiLevelWildcard(String),
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(TopicError::NullCharacter);
    }
    Ok(())
}

/// Validate a topic name used for publishing
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInPublish(topic.to_string()));
    }
    Ok(())
}

/// Validate a subscription filter
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != "+" {
            return Err(TopicError::InvalidSingleLevelWildcard(filter.to_string()));
        }
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(TopicError::InvalidMultiLevelWildcard(filter.to_string()));
        }
    }
    Ok(())
}

/// Whether a concrete topic matches a subscription filter.
///
/// Wildcards at the first level never match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn exact_filter_matches_itself(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,4}") {
            prop_assert!(topic_matches(&topic, &topic));
        }

        #[test]
        fn hash_matches_every_plain_topic(topic in "[a-z0-9]{1,8}(/[a-z0-9]{0,8}){0,4}") {
            prop_assert!(topic_matches("#", &topic));
        }

        #[test]
        fn plus_replaces_any_single_level(
            head in "[a-z]{1,6}",
            middle in "[a-z0-9]{1,6}",
            tail in "[a-z]{1,6}",
        ) {
            let filter = format!("{head}/+/{tail}");
            let topic = format!("{head}/{middle}/{tail}");
            prop_assert!(topic_matches(&filter, &topic));
        }

        #[test]
        fn plus_never_spans_two_levels(
            head in "[a-z]{1,6}",
            a in "[a-z0-9]{1,6}",
            b in "[a-z0-9]{1,6}",
        ) {
            let filter = format!("{head}/+");
            let topic = format!("{head}/{a}/{b}");
            prop_assert!(!topic_matches(&filter, &topic));
        }

        #[test]
        fn plain_topics_are_valid_filters(topic in "[a-z0-9]{1,8}(/[a-z0-9]{1,8}){0,4}") {
            prop_assert!(validate_publish_topic(&topic).is_ok());
            prop_assert!(validate_topic_filter(&topic).is_ok());
        }
    }

    #[test]
    fn test_multi_level_wildcard_matches_parent() {
        assert!(topic_matches("sport/tennis/#", "sport/tennis"));
        assert!(topic_matches("sport/tennis/#", "sport/tennis/player1/score"));
        assert!(!topic_matches("sport/tennis/#", "sport/golf"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("sensors/+/temp", "sensors/kitchen/temp"));
        assert!(!topic_matches("sensors/+/temp", "sensors/kitchen/humidity"));
        assert!(topic_matches("+", "sensors"));
        assert!(!topic_matches("+", "sensors/temp"));
        assert!(topic_matches("sensors/+", "sensors/"));
    }

    #[test]
    fn test_leading_slash_is_a_level() {
        assert!(topic_matches("/mqtttest/test1", "/mqtttest/test1"));
        assert!(!topic_matches("mqtttest/test1", "/mqtttest/test1"));
        assert!(topic_matches("+/mqtttest/#", "/mqtttest/test1"));
    }

    #[test]
    fn test_system_topics_hidden_from_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_publish_topic_validation() {
        assert_eq!(validate_publish_topic(""), Err(TopicError::Empty));
        assert!(matches!(
            validate_publish_topic("a/+/b"),
            Err(TopicError::WildcardInPublish(_))
        ));
        assert!(matches!(
            validate_publish_topic("a/#"),
            Err(TopicError::WildcardInPublish(_))
        ));
        assert_eq!(
            validate_publish_topic("a\0b"),
            Err(TopicError::NullCharacter)
        );
        assert!(matches!(
            validate_publish_topic(&"x".repeat(MAX_TOPIC_LEN + 1)),
            Err(TopicError::TooLong(_))
        ));
        assert!(validate_publish_topic("/temp/shimane").is_ok());
    }

    #[test]
    fn test_filter_validation() {
        assert!(validate_topic_filter("sensors/+/temp").is_ok());
        assert!(validate_topic_filter("sensors/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(matches!(
            validate_topic_filter("sensors/temp+"),
            Err(TopicError::InvalidSingleLevelWildcard(_))
        ));
        assert!(matches!(
            validate_topic_filter("sensors/#/temp"),
            Err(TopicError::InvalidMultiLevelWildcard(_))
        ));
        assert!(matches!(
            validate_topic_filter("sensors#"),
            Err(TopicError::InvalidMultiLevelWildcard(_))
        ));
    }
}
