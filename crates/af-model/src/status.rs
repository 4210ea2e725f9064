use bitflags::bitflags;

bitflags! {
    /// Status as an integer bitflag lattice. The encoding is contractual:
    /// external consumers (DB queries, MQTT topic filters) rely on prefix-
    /// subset queries such as `status & DONE == DONE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    #[serde(transparent)]
    pub struct Status: u16 {
        const NEW     = 1;
        const REJECT  = 2;
        const START   = 4;
        const DONE    = 8;
        const ERROR   = Self::DONE.bits() | 16;
        const CANCEL  = Self::ERROR.bits() | 32;
        const SUCCESS = Self::DONE.bits() | 64;
        const FAIL    = Self::ERROR.bits() | 128;
        const DEPFAIL = Self::CANCEL.bits() | 256;
        // Reserved, never produced by this implementation. Kept per an open
        // question in the original design: some status values exist only as
        // forward-compatible reservations.
        const SKIP    = Self::DONE.bits() | 512;
    }
}

impl Status {
    /// Renders the lowercase name used in MQTT topic segments and as a
    /// column value, e.g. `Status::SUCCESS.topic_word() == "success"`.
    pub fn topic_word(self) -> &'static str {
        match self {
            Status::NEW => "new",
            Status::REJECT => "reject",
            Status::START => "start",
            Status::DONE => "done",
            Status::ERROR => "error",
            Status::CANCEL => "cancel",
            Status::SUCCESS => "success",
            Status::FAIL => "fail",
            Status::DEPFAIL => "depfail",
            Status::SKIP => "skip",
            _ => "unknown",
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::NEW
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_subset_queries() {
        assert_eq!(Status::FAIL & Status::DONE, Status::DONE);
        assert_eq!(Status::DEPFAIL & Status::CANCEL, Status::CANCEL);
        assert_eq!(Status::CANCEL & Status::ERROR, Status::ERROR);
        assert_eq!(Status::SUCCESS & Status::DONE, Status::DONE);
        assert_eq!(Status::NEW & Status::DONE, Status::empty());
    }

    #[test]
    fn bit_values_match_the_contract() {
        assert_eq!(Status::NEW.bits(), 1);
        assert_eq!(Status::REJECT.bits(), 2);
        assert_eq!(Status::START.bits(), 4);
        assert_eq!(Status::DONE.bits(), 8);
        assert_eq!(Status::ERROR.bits(), 24);
        assert_eq!(Status::CANCEL.bits(), 56);
        assert_eq!(Status::SUCCESS.bits(), 72);
        assert_eq!(Status::FAIL.bits(), 152);
        assert_eq!(Status::DEPFAIL.bits(), 312);
        assert_eq!(Status::SKIP.bits(), 520);
    }
}
