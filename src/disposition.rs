use crate::reply::Verdict;

/// Local rejection policy: spam is only refused outright above this score.
/// Deliberately independent of the threshold spamd itself reports, and
/// deliberately not configurable.
pub const REJECT_SPAM_LEVEL: f64 = 50.0;

/// SMTP reply used for rejected spam.
pub const REJECT_CODE: &str = "554";
pub const REJECT_XCODE: &str = "5.7.1";

/// Final answer for one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Deliver, adding the given headers (empty when scoring was skipped).
    Accept { headers: Vec<(String, String)> },
    /// Refuse with a permanent failure.
    Reject {
        code: &'static str,
        xcode: &'static str,
        message: String,
    },
}

impl Disposition {
    fn accept_unscored() -> Self {
        Disposition::Accept {
            headers: Vec::new(),
        }
    }
}

/// Turn whatever the reply parser extracted into a disposition.
///
/// No verdict (scoring skipped, timed out, or protocol error) fails open:
/// plain accept, no annotation.
pub fn decide(verdict: Option<Verdict>, symbols: &str) -> Disposition {
    let Some(verdict) = verdict else {
        return Disposition::accept_unscored();
    };
    if verdict.spam && verdict.score > REJECT_SPAM_LEVEL {
        Disposition::Reject {
            code: REJECT_CODE,
            xcode: REJECT_XCODE,
            message: format!("Spam (score {:.1})", verdict.score),
        }
    } else {
        Disposition::Accept {
            headers: annotation_headers(&verdict, symbols),
        }
    }
}

/// The `X-Spam-*` trio added to accepted, scored mail.
fn annotation_headers(verdict: &Verdict, symbols: &str) -> Vec<(String, String)> {
    let status = format!(
        "{}, score={:.1} required={:.1}{}{}",
        if verdict.spam { "Yes" } else { "No" },
        verdict.score,
        verdict.threshold,
        if symbols.is_empty() { "" } else { " " },
        symbols,
    );
    vec![
        (
            "X-Spam-Flag".to_string(),
            if verdict.spam { "YES" } else { "NO" }.to_string(),
        ),
        ("X-Spam-Status".to_string(), status),
        ("X-Spam-Level".to_string(), "*".repeat(spam_level(verdict.score))),
    ]
}

/// Marker count for `X-Spam-Level`: the score truncated toward zero.
fn spam_level(score: f64) -> usize {
    if score.is_sign_negative() || !score.is_finite() {
        return 0;
    }
    score.trunc() as usize
}

/// One-line summary logged for every disposition, spam or ham.
pub fn summary_line(
    disposition: &Disposition,
    verdict: Option<Verdict>,
    symbols: &str,
    from: &str,
    to: &str,
    subject: &str,
) -> String {
    let verdict = verdict.unwrap_or(Verdict {
        spam: false,
        score: 0.0,
        threshold: 0.0,
    });
    format!(
        "{} ({} {:.1}/{:.1}{}{}), From: {}, To: {}, Subject: {}",
        match disposition {
            Disposition::Reject { .. } => "REJECT",
            Disposition::Accept { .. } => "ACCEPT",
        },
        if verdict.spam { "SPAM" } else { "ham" },
        verdict.score,
        verdict.threshold,
        if symbols.is_empty() { "" } else { " " },
        symbols,
        from,
        to,
        subject,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(spam: bool, score: f64, threshold: f64) -> Option<Verdict> {
        Some(Verdict {
            spam,
            score,
            threshold,
        })
    }

    fn headers(disposition: Disposition) -> Vec<(String, String)> {
        match disposition {
            Disposition::Accept { headers } => headers,
            Disposition::Reject { .. } => panic!("expected accept"),
        }
    }

    #[test]
    fn no_verdict_accepts_without_annotation() {
        assert_eq!(decide(None, ""), Disposition::accept_unscored());
    }

    #[test]
    fn reject_threshold_is_strict() {
        assert!(matches!(
            decide(verdict(true, 50.0, 5.0), ""),
            Disposition::Accept { .. }
        ));
        assert!(matches!(
            decide(verdict(true, 50.01, 5.0), ""),
            Disposition::Reject { .. }
        ));
    }

    #[test]
    fn ham_is_never_rejected() {
        assert!(matches!(
            decide(verdict(false, 99.0, 5.0), ""),
            Disposition::Accept { .. }
        ));
    }

    #[test]
    fn reject_reply_carries_the_score() {
        match decide(verdict(true, 75.0, 5.0), "SYMBOL_A") {
            Disposition::Reject {
                code,
                xcode,
                message,
            } => {
                assert_eq!(code, "554");
                assert_eq!(xcode, "5.7.1");
                assert!(message.contains("75.0"));
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn accepted_spam_is_annotated() {
        let headers = headers(decide(verdict(true, 7.8, 5.0), "BAYES_99,RDNS_NONE"));
        assert_eq!(
            headers,
            vec![
                ("X-Spam-Flag".to_string(), "YES".to_string()),
                (
                    "X-Spam-Status".to_string(),
                    "Yes, score=7.8 required=5.0 BAYES_99,RDNS_NONE".to_string()
                ),
                ("X-Spam-Level".to_string(), "*******".to_string()),
            ]
        );
    }

    #[test]
    fn status_header_omits_separator_without_symbols() {
        let headers = headers(decide(verdict(false, 0.9, 5.0), ""));
        assert_eq!(headers[1].1, "No, score=0.9 required=5.0");
        assert_eq!(headers[2].1, "");
    }

    #[test]
    fn spam_level_truncates_toward_zero() {
        assert_eq!(spam_level(0.9), 0);
        assert_eq!(spam_level(7.99), 7);
        assert_eq!(spam_level(-3.2), 0);
    }

    #[test]
    fn summary_line_format() {
        let disposition = decide(verdict(true, 75.0, 5.0), "SYMBOL_A,SYMBOL_B");
        let line = summary_line(
            &disposition,
            verdict(true, 75.0, 5.0),
            "SYMBOL_A,SYMBOL_B",
            "a@x.com",
            "b@y.com",
            "hi",
        );
        assert_eq!(
            line,
            "REJECT (SPAM 75.0/5.0 SYMBOL_A,SYMBOL_B), From: a@x.com, To: b@y.com, Subject: hi"
        );
    }

    #[test]
    fn unscored_summary_logs_zeros() {
        let line = summary_line(&decide(None, ""), None, "", "", "", "");
        assert!(line.starts_with("ACCEPT (ham 0.0/0.0)"));
    }
}
