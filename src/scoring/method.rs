use super::{Scorer, SubScore};
use crate::request::{IncomingRequest, Method};

/// State-changing verbs score highest, plain reads lowest.
#[derive(Default)]
pub struct MethodScorer;

impl MethodScorer {
    pub fn level(method: Method) -> u8 {
        match method {
            Method::Post | Method::Put => 10,
            Method::Delete | Method::Patch | Method::Pri => 8,
            Method::Other => 7,
            Method::Get | Method::Head | Method::Options | Method::Trace | Method::Connect => 6,
        }
    }
}

impl Scorer for MethodScorer {
    fn name(&self) -> &'static str {
        "method"
    }

    fn score(&self, req: &IncomingRequest) -> SubScore {
        SubScore::Partial(Self::level(req.method))
    }
}
