//! Program points.

use std::fmt;

/// Separator between nested call-stack-frame prefixes.
pub const STACK_FRAME_DELIMITER: char = '/';

/// Identity of a program point.
///
/// Plain labels name an instruction by its index (`from`). Jump edges get a
/// synthetic label `from:to` so that the taken and not-taken outcomes of a
/// branch are distinct nodes even when they reach the same successor.
/// Labels inside an inlined subprogram carry the call-stack-frame prefix of
/// the invocation; `special_label` distinguishes other synthetic nodes such
/// as loop counters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub stack_frame_prefix: String,
    pub from: i32,
    pub to: i32,
    pub special_label: String,
}

impl Label {
    pub const ENTRY_INDEX: i32 = -1;
    pub const EXIT_INDEX: i32 = i32::MAX;

    pub fn new(from: i32) -> Self {
        Label {
            stack_frame_prefix: String::new(),
            from,
            to: -1,
            special_label: String::new(),
        }
    }

    pub fn with_prefix(from: i32, prefix: &str) -> Self {
        Label {
            stack_frame_prefix: prefix.to_string(),
            ..Label::new(from)
        }
    }

    /// The edge label for the jump `from -> to`.
    pub fn jump(from: i32, to: i32, prefix: &str) -> Self {
        Label {
            stack_frame_prefix: prefix.to_string(),
            from,
            to,
            special_label: String::new(),
        }
    }

    pub fn entry() -> Self {
        Label::new(Self::ENTRY_INDEX)
    }

    pub fn exit() -> Self {
        Label::new(Self::EXIT_INDEX)
    }

    /// The synthetic node that bumps the loop counter of `head`.
    pub fn increment_counter(head: &Label) -> Self {
        Label {
            special_label: "counter".to_string(),
            ..head.clone()
        }
    }

    pub fn is_entry(&self) -> bool {
        self.from == Self::ENTRY_INDEX && self.stack_frame_prefix.is_empty()
    }

    pub fn is_exit(&self) -> bool {
        self.from == Self::EXIT_INDEX && self.stack_frame_prefix.is_empty()
    }

    pub fn is_jump(&self) -> bool {
        self.to != -1
    }

    /// Depth of the call stack this label executes in; 1 for the main program.
    pub fn call_stack_depth(&self) -> usize {
        if self.stack_frame_prefix.is_empty() {
            1
        } else {
            2 + self.stack_frame_prefix.matches(STACK_FRAME_DELIMITER).count()
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_entry() {
            return write!(f, "entry");
        }
        if self.is_exit() {
            return write!(f, "exit");
        }
        if !self.stack_frame_prefix.is_empty() {
            write!(f, "{}{}", self.stack_frame_prefix, STACK_FRAME_DELIMITER)?;
        }
        write!(f, "{}", self.from)?;
        if self.to != -1 {
            write!(f, ":{}", self.to)?;
        }
        if !self.special_label.is_empty() {
            write!(f, " ({})", self.special_label)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_and_display() {
        let entry = Label::entry();
        let first = Label::new(0);
        let exit = Label::exit();
        assert!(entry < first && first < exit);
        assert_eq!(Label::jump(3, 7, "").to_string(), "3:7");
        assert_eq!(Label::with_prefix(5, "2").to_string(), "2/5");
        assert_eq!(Label::increment_counter(&Label::new(1)).to_string(), "1 (counter)");
        assert_eq!(entry.to_string(), "entry");
    }

    #[test]
    fn test_call_stack_depth() {
        assert_eq!(Label::new(4).call_stack_depth(), 1);
        assert_eq!(Label::with_prefix(4, "2").call_stack_depth(), 2);
        assert_eq!(Label::with_prefix(4, "2/9").call_stack_depth(), 3);
    }
}
