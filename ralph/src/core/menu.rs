//! Menu option types shared by the orchestrator and menu implementations.
//!
//! The orchestrator only ever asks "pick one of these"; how the options are
//! drawn is up to the [`crate::io::menu::Menu`] implementation.

/// One selectable entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuOption<T> {
    pub label: String,
    pub value: T,
    pub hotkey: Option<char>,
    /// When set, the option is shown but cannot be chosen.
    pub disabled_reason: Option<String>,
}

impl<T> MenuOption<T> {
    pub fn new(label: impl Into<String>, value: T) -> Self {
        Self {
            label: label.into(),
            value,
            hotkey: None,
            disabled_reason: None,
        }
    }

    pub fn hotkey(mut self, key: char) -> Self {
        self.hotkey = Some(key);
        self
    }

    pub fn disabled(mut self, reason: impl Into<String>) -> Self {
        self.disabled_reason = Some(reason.into());
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.disabled_reason.is_none()
    }
}

/// Outcome of presenting a menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MenuChoice<T> {
    Selected(T),
    Cancelled,
}

/// Resolve typed input against the options.
///
/// Accepts a hotkey (case-insensitive), a 1-based index, or a full label
/// (case-insensitive). Disabled options never resolve.
pub fn resolve_input<'a, T>(
    options: &'a [MenuOption<T>],
    input: &str,
) -> Option<&'a MenuOption<T>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let mut chars = input.chars();
    let by_hotkey = match (chars.next(), chars.next()) {
        (Some(key), None) => options
            .iter()
            .find(|opt| opt.hotkey.is_some_and(|hk| hk.eq_ignore_ascii_case(&key))),
        _ => None,
    };

    let found = by_hotkey
        .or_else(|| {
            input
                .parse::<usize>()
                .ok()
                .and_then(|idx| idx.checked_sub(1))
                .and_then(|idx| options.get(idx))
        })
        .or_else(|| options.iter().find(|opt| opt.label.eq_ignore_ascii_case(input)))?;

    found.is_enabled().then_some(found)
}

/// Render options as numbered lines, e.g. `1) [r] Resume`.
pub fn render_options<T>(options: &[MenuOption<T>]) -> Vec<String> {
    options
        .iter()
        .enumerate()
        .map(|(idx, opt)| {
            let mut line = format!("{})", idx + 1);
            if let Some(key) = opt.hotkey {
                line.push_str(&format!(" [{key}]"));
            }
            line.push(' ');
            line.push_str(&opt.label);
            if let Some(reason) = &opt.disabled_reason {
                line.push_str(&format!(" (unavailable: {reason})"));
            }
            line
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Vec<MenuOption<&'static str>> {
        vec![
            MenuOption::new("Resume", "resume").hotkey('r'),
            MenuOption::new("Discard", "discard").hotkey('d'),
            MenuOption::new("Replan", "replan").disabled("no specs"),
        ]
    }

    #[test]
    fn resolves_hotkey_index_and_label() {
        let opts = options();
        assert_eq!(resolve_input(&opts, "R").map(|o| o.value), Some("resume"));
        assert_eq!(resolve_input(&opts, "2").map(|o| o.value), Some("discard"));
        assert_eq!(
            resolve_input(&opts, "discard").map(|o| o.value),
            Some("discard")
        );
    }

    #[test]
    fn disabled_and_unknown_do_not_resolve() {
        let opts = options();
        assert!(resolve_input(&opts, "3").is_none());
        assert!(resolve_input(&opts, "Replan").is_none());
        assert!(resolve_input(&opts, "0").is_none());
        assert!(resolve_input(&opts, "").is_none());
        assert!(resolve_input(&opts, "zzz").is_none());
    }

    #[test]
    fn render_marks_disabled_options() {
        let lines = render_options(&options());
        assert_eq!(lines[0], "1) [r] Resume");
        assert_eq!(lines[2], "3) Replan (unavailable: no specs)");
    }
}
