use chrono::{Local, NaiveDate, TimeZone};
use shared::{Message, UserId};

/// Two image messages more than this far apart never share a group.
const IMAGE_RUN_WINDOW_SECS: i64 = 90;

/// A derived, renderable unit. Never persisted; recomputed from the raw
/// message set on every change.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineItem {
    DaySeparator { label: String, date: NaiveDate },
    Single(Message),
    ImageGroup { sender: UserId, messages: Vec<Message> },
}

/// Projects the ascending message set into renderable items using the local
/// calendar for day boundaries.
pub fn project(messages: &[Message]) -> Vec<TimelineItem> {
    project_in_zone(messages, &Local, Local::now().date_naive())
}

/// Deterministic core of `project`: the zone and the reference date are
/// explicit so the transform is a pure function of its inputs.
pub fn project_in_zone<Tz: TimeZone>(
    messages: &[Message],
    zone: &Tz,
    today: NaiveDate,
) -> Vec<TimelineItem> {
    with_day_separators(group_messages(messages), zone, today)
}

fn group_messages(messages: &[Message]) -> Vec<TimelineItem> {
    let mut items = Vec::new();
    let mut run: Vec<Message> = Vec::new();

    for message in messages {
        let joins_run = message.is_image()
            && run.last().is_some_and(|previous| {
                run[0].sender == message.sender
                    && (message.created_at - previous.created_at).num_seconds()
                        <= IMAGE_RUN_WINDOW_SECS
            });
        if joins_run {
            run.push(message.clone());
            continue;
        }

        flush_run(&mut items, &mut run);
        if message.is_image() {
            run.push(message.clone());
        } else {
            items.push(TimelineItem::Single(message.clone()));
        }
    }

    flush_run(&mut items, &mut run);
    items
}

fn flush_run(items: &mut Vec<TimelineItem>, run: &mut Vec<Message>) {
    match run.len() {
        0 => {}
        // A run of one degrades to a plain message.
        1 => items.push(TimelineItem::Single(run.remove(0))),
        _ => {
            let sender = run[0].sender.clone();
            items.push(TimelineItem::ImageGroup {
                sender,
                messages: std::mem::take(run),
            });
        }
    }
}

fn with_day_separators<Tz: TimeZone>(
    items: Vec<TimelineItem>,
    zone: &Tz,
    today: NaiveDate,
) -> Vec<TimelineItem> {
    let mut out = Vec::with_capacity(items.len());
    let mut previous_day: Option<NaiveDate> = None;

    for item in items {
        let day = item_day(&item, zone);
        if previous_day.is_some() && previous_day != Some(day) {
            out.push(TimelineItem::DaySeparator {
                label: day_label(day, today),
                date: day,
            });
        }
        previous_day = Some(day);
        out.push(item);
    }

    out
}

fn item_day<Tz: TimeZone>(item: &TimelineItem, zone: &Tz) -> NaiveDate {
    let at = match item {
        TimelineItem::Single(message) => message.created_at,
        TimelineItem::ImageGroup { messages, .. } => messages[0].created_at,
        TimelineItem::DaySeparator { date, .. } => return *date,
    };
    at.with_timezone(zone).date_naive()
}

fn day_label(date: NaiveDate, today: NaiveDate) -> String {
    match date.signed_duration_since(today).num_days() {
        0 => "Today".to_owned(),
        -1 => "Yesterday".to_owned(),
        1 => "Tomorrow".to_owned(),
        -6..=6 => date.format("%A").to_string(),
        _ => date.format("%-d %B %Y").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use shared::{Attachment, ConversationId, MessageId};

    fn at(base: DateTime<Utc>, offset_secs: i64) -> DateTime<Utc> {
        base + Duration::seconds(offset_secs)
    }

    fn text_message(id: &str, sender: &str, created_at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(id),
            conversation_id: ConversationId::new("c1"),
            sender: UserId::new(sender),
            text: Some(format!("text {id}")),
            attachment: None,
            created_at,
        }
    }

    fn image_message(id: &str, sender: &str, created_at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(id),
            conversation_id: ConversationId::new("c1"),
            sender: UserId::new(sender),
            text: None,
            attachment: Some(Attachment {
                file_name: format!("{id}.png"),
                url: format!("https://files/{id}.png"),
                mime_type: "image/png".into(),
                size_bytes: 1,
                storage_path: None,
            }),
            created_at,
        }
    }

    fn ids(item: &TimelineItem) -> Vec<&str> {
        match item {
            TimelineItem::Single(message) => vec![message.id.as_str()],
            TimelineItem::ImageGroup { messages, .. } => {
                messages.iter().map(|m| m.id.as_str()).collect()
            }
            TimelineItem::DaySeparator { .. } => vec![],
        }
    }

    #[test]
    fn window_and_text_break_image_runs() {
        let base = "2026-03-10T12:00:00Z".parse().expect("timestamp");
        let messages = vec![
            image_message("imgA", "x", at(base, 0)),
            image_message("imgB", "x", at(base, 30)),
            text_message("textC", "x", at(base, 40)),
            image_message("imgD", "x", at(base, 200)),
        ];

        let items = project_in_zone(&messages, &Utc, base.date_naive());
        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], TimelineItem::ImageGroup { .. }));
        assert_eq!(ids(&items[0]), vec!["imgA", "imgB"]);
        assert_eq!(ids(&items[1]), vec!["textC"]);
        assert!(matches!(&items[2], TimelineItem::Single(_)));
        assert_eq!(ids(&items[2]), vec!["imgD"]);
    }

    #[test]
    fn run_membership_is_exactly_ninety_seconds_from_the_previous_member() {
        let base = "2026-03-10T12:00:00Z".parse().expect("timestamp");
        let messages = vec![
            image_message("a", "x", at(base, 0)),
            image_message("b", "x", at(base, 90)),
            image_message("c", "x", at(base, 181)),
        ];

        let items = project_in_zone(&messages, &Utc, base.date_naive());
        assert_eq!(ids(&items[0]), vec!["a", "b"]);
        assert_eq!(ids(&items[1]), vec!["c"]);
    }

    #[test]
    fn sender_change_closes_the_run() {
        let base = "2026-03-10T12:00:00Z".parse().expect("timestamp");
        let messages = vec![
            image_message("a", "x", at(base, 0)),
            image_message("b", "y", at(base, 10)),
            image_message("c", "y", at(base, 20)),
        ];

        let items = project_in_zone(&messages, &Utc, base.date_naive());
        assert!(matches!(&items[0], TimelineItem::Single(_)));
        assert_eq!(ids(&items[1]), vec!["b", "c"]);
    }

    #[test]
    fn day_separators_sit_between_items_of_different_days() {
        let monday = "2026-03-09T23:50:00Z".parse().expect("timestamp");
        let tuesday = "2026-03-10T00:10:00Z".parse().expect("timestamp");
        let messages = vec![
            text_message("m1", "x", monday),
            text_message("m2", "x", tuesday),
        ];

        let today = tuesday.date_naive();
        let items = project_in_zone(&messages, &Utc, today);
        assert_eq!(items.len(), 3);
        assert_eq!(ids(&items[0]), vec!["m1"]);
        match &items[1] {
            TimelineItem::DaySeparator { label, date } => {
                assert_eq!(label, "Today");
                assert_eq!(*date, today);
            }
            other => panic!("expected separator, got {other:?}"),
        }
        assert_eq!(ids(&items[2]), vec!["m2"]);
    }

    #[test]
    fn labels_cover_relative_weekday_and_absolute_dates() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).expect("date");
        assert_eq!(day_label(today, today), "Today");
        assert_eq!(day_label(today.pred_opt().expect("date"), today), "Yesterday");
        assert_eq!(day_label(today.succ_opt().expect("date"), today), "Tomorrow");
        // 2026-03-06 is four days back, still inside the weekday window.
        assert_eq!(
            day_label(NaiveDate::from_ymd_opt(2026, 3, 6).expect("date"), today),
            "Friday"
        );
        assert_eq!(
            day_label(NaiveDate::from_ymd_opt(2026, 1, 2).expect("date"), today),
            "2 January 2026"
        );
    }

    #[test]
    fn projection_is_deterministic() {
        let base = "2026-03-10T12:00:00Z".parse().expect("timestamp");
        let messages = vec![
            image_message("a", "x", at(base, 0)),
            image_message("b", "x", at(base, 30)),
            text_message("c", "y", at(base, 60)),
        ];
        let first = project_in_zone(&messages, &Utc, base.date_naive());
        let second = project_in_zone(&messages, &Utc, base.date_naive());
        assert_eq!(first, second);
    }
}
