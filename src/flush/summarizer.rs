//! Deterministic rule-based summarization.
//!
//! No model is called. The summary quotes the first message of the segment,
//! notes how many messages were elided, and quotes the last few messages for
//! continuity. Content is treated as opaque text, including structured tool
//! payloads.
use crate::config::DEFAULT_SUMMARY_KEEP_LAST;
use crate::error::MemoryResult;
use crate::tokens::TokenCountService;
use crate::types::{Message, SUMMARY_TAG};

/// Appended to a summary cut short to fit its token target.
pub const TRUNCATION_MARKER: &str = "...";

/// Segments shorter than this produce no summary.
pub const MIN_SUMMARIZABLE: usize = 3;

/// Builds summary messages from an oldest-first segment.
#[derive(Debug, Clone)]
pub struct RuleBasedSummarizer {
    keep_last: usize,
}

impl Default for RuleBasedSummarizer {
    fn default() -> Self {
        Self::new(DEFAULT_SUMMARY_KEEP_LAST)
    }
}

impl RuleBasedSummarizer {
    pub fn new(keep_last: usize) -> Self {
        Self { keep_last }
    }

    /// Summary text for `segment`, or an empty string when the segment is
    /// too short to be worth summarizing.
    ///
    /// The text is truncated from the end to fit `target_tokens`; 0 means
    /// no limit.
    pub fn summarize(
        &self,
        segment: &[Message],
        target_tokens: usize,
        counter: &TokenCountService,
    ) -> MemoryResult<String> {
        if segment.len() < MIN_SUMMARIZABLE {
            return Ok(String::new());
        }

        let tail_len = self.keep_last.min(segment.len() - 1);
        let tail = &segment[segment.len() - tail_len..];
        let elided = segment.len() - 1 - tail_len;

        let mut text = format!(
            "Summary of {} messages: {}",
            segment.len(),
            quote(&segment[0])
        );
        if elided > 0 {
            text.push_str(&format!(" ... ({} messages elided) ...", elided));
        }
        for message in tail {
            text.push_str(" | ");
            text.push_str(&quote(message));
        }

        self.truncate(text, target_tokens, counter)
    }

    /// Build the summary message itself, sized so the tagged content fits
    /// `summary_tokens`. `None` when no summary is produced.
    pub fn summary_message(
        &self,
        segment: &[Message],
        summary_tokens: usize,
        counter: &TokenCountService,
    ) -> MemoryResult<Option<Message>> {
        let target = if summary_tokens == 0 {
            0
        } else {
            let tag = counter.count_text(&format!("{} ", SUMMARY_TAG))?;
            match summary_tokens.checked_sub(tag) {
                Some(0) | None => return Ok(None),
                Some(left) => left,
            }
        };

        let body = self.summarize(segment, target, counter)?;
        if body.is_empty() {
            return Ok(None);
        }
        Ok(Some(Message::summary(&body, segment.len())))
    }

    fn truncate(
        &self,
        text: String,
        target_tokens: usize,
        counter: &TokenCountService,
    ) -> MemoryResult<String> {
        if target_tokens == 0 || counter.count_text(&text)? <= target_tokens {
            return Ok(text);
        }

        // Largest char prefix whose marked form fits.
        let boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        let (mut lo, mut hi) = (0usize, boundaries.len());
        let mut best: Option<usize> = None;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let candidate = format!("{}{}", text[..boundaries[mid]].trim_end(), TRUNCATION_MARKER);
            if counter.count_text(&candidate)? <= target_tokens {
                best = Some(mid);
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        Ok(match best {
            Some(0) | None => String::new(),
            Some(n) => format!("{}{}", text[..boundaries[n]].trim_end(), TRUNCATION_MARKER),
        })
    }
}

fn quote(message: &Message) -> String {
    format!("[{}]: {}", message.role, message.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::CharRatioCounter;
    use std::sync::Arc;

    fn chars() -> TokenCountService {
        TokenCountService::new(Arc::new(CharRatioCounter::new(1)), None).unwrap()
    }

    fn segment(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("m{}", i))).collect()
    }

    #[test]
    fn test_short_segment_yields_nothing() {
        let summarizer = RuleBasedSummarizer::default();
        assert!(summarizer.summarize(&segment(2), 0, &chars()).unwrap().is_empty());
        assert!(
            summarizer
                .summary_message(&segment(2), 500, &chars())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_first_and_last_messages_quoted() {
        let text = RuleBasedSummarizer::default()
            .summarize(&segment(6), 0, &chars())
            .unwrap();
        assert_eq!(
            text,
            "Summary of 6 messages: [user]: m0 ... (3 messages elided) ... | [user]: m4 | [user]: m5"
        );
    }

    #[test]
    fn test_no_elision_note_when_nothing_skipped() {
        let text = RuleBasedSummarizer::default()
            .summarize(&segment(3), 0, &chars())
            .unwrap();
        assert!(!text.contains("elided"));
        assert!(text.ends_with("[user]: m2"));
    }

    #[test]
    fn test_truncated_to_target() {
        let counter = chars();
        let text = RuleBasedSummarizer::default()
            .summarize(&segment(10), 30, &counter)
            .unwrap();
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert!(counter.count_text(&text).unwrap() <= 30);
        assert!(text.starts_with("Summary of 10"));
    }

    #[test]
    fn test_summary_message_fits_budget() {
        let counter = chars();
        let message = RuleBasedSummarizer::default()
            .summary_message(&segment(12), 40, &counter)
            .unwrap()
            .unwrap();
        assert!(message.is_summary());
        assert!(counter.count_message(&message).unwrap() <= 40);
    }

    #[test]
    fn test_deterministic() {
        let summarizer = RuleBasedSummarizer::new(1);
        let a = summarizer.summarize(&segment(8), 0, &chars()).unwrap();
        let b = summarizer.summarize(&segment(8), 0, &chars()).unwrap();
        assert_eq!(a, b);
    }
}
