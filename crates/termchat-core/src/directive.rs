//! Splits `<cmd>...</cmd>` directives out of content text.

pub const OPEN_MARKER: &str = "<cmd>";
pub const CLOSE_MARKER: &str = "</cmd>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Text to display, with the marked span removed.
    pub visible: String,
    /// Text between the markers. `None` unless both markers were found in order.
    pub command: Option<String>,
}

/// Extracts the first directive. Markers that are missing, reversed or
/// unbalanced leave the text untouched.
pub fn extract_directive(text: &str) -> Directive {
    let plain = || Directive {
        visible: text.to_string(),
        command: None,
    };
    let (Some(open), Some(close)) = (text.find(OPEN_MARKER), text.find(CLOSE_MARKER)) else {
        return plain();
    };
    if open >= close {
        return plain();
    }

    let command = &text[open + OPEN_MARKER.len()..close];
    let mut visible = String::with_capacity(text.len());
    visible.push_str(&text[..open]);
    visible.push_str(&text[close + CLOSE_MARKER.len()..]);
    Directive {
        visible,
        command: Some(command.to_string()),
    }
}
