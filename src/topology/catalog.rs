//! Per-service stream declarations
//!
//! Stream names and subjects are part of the broker contract shared by
//! every deployment; changing them creates new streams.

use super::{RetentionPolicy, StreamDefinition, TopicDefinition, TopologyRegistry};
use std::time::Duration;

pub const STREAM_LESSON: &str = "lesson";
pub const SUBJECT_LESSON: &str = "Lesson.*";
pub const SUBJECT_LESSON_CREATED: &str = "Lesson.Created";
pub const SUBJECT_LESSON_UPDATED: &str = "Lesson.Updated";
pub const SUBJECT_LESSON_DELETED: &str = "Lesson.Deleted";

pub const STREAM_STUDENT_PACKAGE_V2: &str = "studentpackagev2";
pub const SUBJECT_STUDENT_PACKAGE_V2_UPSERTED: &str = "StudentPackageV2.Upserted";

pub const STREAM_SYNC_STUDENT_PACKAGE: &str = "syncstudentpackage";
pub const SUBJECT_SYNC_STUDENT_PACKAGE: &str = "SyncStudentPackage.Synced";

pub const STREAM_SYNC_USER_COURSE: &str = "syncusercourse";
pub const SUBJECT_SYNC_USER_COURSE: &str = "SyncUserCourse.Synced";

pub const STREAM_CHAT: &str = "chat";
pub const SUBJECT_CHAT: &str = "chat.chat.>";
pub const SUBJECT_CHAT_CREATED: &str = "chat.chat.created";
pub const SUBJECT_CHAT_MESSAGE_CREATED: &str = "chat.chat.message.created";

pub const STREAM_TIMESHEET_LESSON: &str = "timesheetlesson";
pub const SUBJECT_TIMESHEET_LESSON_LOCKED: &str = "TimesheetLesson.Locked";

pub const STREAM_ACTIVITY_LOG: &str = "activitylog";
pub const SUBJECT_ACTIVITY_LOG_CREATED: &str = "ActivityLog.Created";

const ONE_GIB: i64 = 1024 * 1024 * 1024;

/// Lesson management streams
pub fn lessonmgmt() -> Vec<StreamDefinition> {
    vec![StreamDefinition::new(STREAM_LESSON)
        .subject(SUBJECT_LESSON)
        .retention(RetentionPolicy::InterestBased)]
}

/// Payment and enrollment streams
pub fn payment() -> Vec<StreamDefinition> {
    vec![
        StreamDefinition::new(STREAM_STUDENT_PACKAGE_V2)
            .subject(SUBJECT_STUDENT_PACKAGE_V2_UPSERTED)
            .retention(RetentionPolicy::InterestBased),
        StreamDefinition::new(STREAM_SYNC_STUDENT_PACKAGE)
            .subject(SUBJECT_SYNC_STUDENT_PACKAGE)
            .retention(RetentionPolicy::InterestBased),
    ]
}

/// Partner synchronisation streams
pub fn enigma() -> Vec<StreamDefinition> {
    vec![StreamDefinition::new(STREAM_SYNC_USER_COURSE)
        .subject(SUBJECT_SYNC_USER_COURSE)
        .retention(RetentionPolicy::InterestBased)]
}

/// Conversation streams
pub fn tom() -> Vec<StreamDefinition> {
    vec![StreamDefinition::new(STREAM_CHAT)
        .subject(SUBJECT_CHAT)
        .retention(RetentionPolicy::InterestBased)]
}

/// Timesheet streams
pub fn timesheet() -> Vec<StreamDefinition> {
    vec![StreamDefinition::new(STREAM_TIMESHEET_LESSON)
        .subject(SUBJECT_TIMESHEET_LESSON_LOCKED)
        .retention(RetentionPolicy::InterestBased)]
}

/// Audit streams kept by size and age for replay
pub fn activity_log() -> Vec<StreamDefinition> {
    vec![StreamDefinition::new(STREAM_ACTIVITY_LOG)
        .subject(SUBJECT_ACTIVITY_LOG_CREATED)
        .retention(RetentionPolicy::LimitsBased)
        .max_bytes(ONE_GIB)
        .max_age(Duration::from_secs(7 * 24 * 3600))]
}

/// Simple-queue topics fed by change data capture
pub fn data_pipeline_topics() -> Vec<TopicDefinition> {
    vec![
        TopicDefinition::new("student_event_logs", 3, 3),
        TopicDefinition::new("order_event_logs", 3, 3),
    ]
}

/// Registry with every service declaration
pub fn platform() -> TopologyRegistry {
    let mut registry = TopologyRegistry::new();
    registry
        .register("lessonmgmt", lessonmgmt)
        .register("payment", payment)
        .register("enigma", enigma)
        .register("tom", tom)
        .register("timesheet", timesheet)
        .register("activitylog", activity_log)
        .register_topics("datapipeline", data_pipeline_topics);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_topology_is_valid() {
        let registry = platform();
        registry.validate().unwrap();
        assert_eq!(registry.streams().count(), 7);
        assert_eq!(registry.topics().count(), 2);
    }

    #[test]
    fn test_declarations_are_deterministic() {
        assert_eq!(lessonmgmt(), lessonmgmt());
        assert_eq!(payment(), payment());
    }

    #[test]
    fn test_subjects_route_to_declared_streams() {
        let registry = platform();
        assert_eq!(
            registry.stream_for_subject(SUBJECT_LESSON_CREATED).unwrap().name,
            STREAM_LESSON
        );
        assert_eq!(
            registry.stream_for_subject(SUBJECT_CHAT_MESSAGE_CREATED).unwrap().name,
            STREAM_CHAT
        );
        assert_eq!(
            registry.stream(STREAM_ACTIVITY_LOG).unwrap().retention,
            RetentionPolicy::LimitsBased
        );
    }
}
