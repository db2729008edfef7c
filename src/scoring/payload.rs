use super::{Scorer, SubScore};
use crate::request::IncomingRequest;

const PRESENT: u8 = 10;
const ABSENT: u8 = 5;

/// Any query string at all leans hostile.
#[derive(Default)]
pub struct QueryScorer;

impl Scorer for QueryScorer {
    fn name(&self) -> &'static str {
        "query"
    }

    fn score(&self, req: &IncomingRequest) -> SubScore {
        match req.query_string.as_deref() {
            Some(q) if !q.is_empty() => SubScore::Partial(PRESENT),
            _ => SubScore::Partial(ABSENT),
        }
    }
}

/// Same rule for a request body.
#[derive(Default)]
pub struct BodyScorer;

impl Scorer for BodyScorer {
    fn name(&self) -> &'static str {
        "body"
    }

    fn score(&self, req: &IncomingRequest) -> SubScore {
        if req.has_body() {
            SubScore::Partial(PRESENT)
        } else {
            SubScore::Partial(ABSENT)
        }
    }
}
