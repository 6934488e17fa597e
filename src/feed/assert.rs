//! Helpers for tests that read a feed and check what came out.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::feed::payload::parse_json_value_timestamps;
use crate::feed::Feed;
use crate::hlc::Timestamp;

/// Reads the next `n` row messages, skipping resolved ones, and returns them
/// as sorted `topic: key->value` strings.
pub fn collect_payloads(feed: &mut dyn Feed, ctx: &Context, n: usize) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let m = feed.next(ctx)?;
        if m.is_resolved() {
            continue;
        }
        out.push(format!("{}: {}->{}", m.topic, m.key_str(), m.value_str()));
    }
    out.sort();
    Ok(out)
}

/// Reads one message, which must be a resolved timestamp, and returns it.
pub fn expect_resolved(feed: &mut dyn Feed, ctx: &Context) -> Result<Timestamp> {
    let m = feed.next(ctx)?;
    match &m.resolved {
        Some(payload) => Ok(parse_json_value_timestamps(payload)?.1),
        None => Err(Error::Decode(format!("expected a resolved timestamp, got {}", m))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedMessage;
    use std::collections::VecDeque;

    struct Canned(VecDeque<FeedMessage>);

    impl Feed for Canned {
        fn partitions(&self) -> Vec<String> {
            vec!["0".into()]
        }
        fn next(&mut self, _ctx: &Context) -> Result<FeedMessage> {
            self.0.pop_front().ok_or(Error::FeedEnded)
        }
        fn pause(&mut self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn resume(&mut self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_collect_and_expect() {
        let mut feed = Canned(VecDeque::from(vec![
            FeedMessage::row("foo", "0", Some(b"[2]".to_vec()), br#"{"after": {"id": 2}}"#.to_vec()),
            FeedMessage::resolved("", "0", br#"{"resolved": "5.0000000001"}"#.to_vec()),
            FeedMessage::row("foo", "0", Some(b"[1]".to_vec()), br#"{"after": {"id": 1}}"#.to_vec()),
            FeedMessage::resolved("", "0", br#"{"resolved": "6.0000000000"}"#.to_vec()),
            FeedMessage::row("foo", "0", Some(b"[3]".to_vec()), b"{}".to_vec()),
        ]));
        let ctx = Context::background();

        let got = collect_payloads(&mut feed, &ctx, 2).unwrap();
        assert_eq!(
            got,
            vec![
                r#"foo: [1]->{"after": {"id": 1}}"#,
                r#"foo: [2]->{"after": {"id": 2}}"#,
            ]
        );
        assert_eq!(expect_resolved(&mut feed, &ctx).unwrap(), Timestamp::from_wall(6));
        assert!(matches!(expect_resolved(&mut feed, &ctx), Err(Error::Decode(_))));
        assert!(matches!(collect_payloads(&mut feed, &ctx, 1), Err(Error::FeedEnded)));
    }
}
