//! Line-oriented text fix-ups around the compare-mode toolchain runs.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::rewrite::RewriteRuleSet;

static HYPERTARGET_OPENER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\hypertarget\{[^}]*\}\{%?").expect("valid hypertarget pattern"));

static LABEL_WITH_STRAY_BRACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\\label\{[^}]*\})\}").expect("valid label pattern"));

/// Apply every rule, in order, to each line; only the first occurrence of a
/// rule's search text per line is replaced.
pub fn rewrite(text: &str, rules: &RewriteRuleSet) -> String {
    if rules.is_empty() {
        return text.to_string();
    }
    map_lines(text, |line| {
        let mut line = line.to_string();
        for rule in rules.iter() {
            line = line.replacen(&rule.search, &rule.replace, 1);
        }
        line
    })
}

/// Strip Pandoc's section anchors so `latexdiff` sees plain headings.
///
/// Per line, the first `\hypertarget{id}{` opener (and an optional trailing
/// `%`) is removed and the first `\label{id}}` loses its closing brace.
pub fn fix_markup(text: &str) -> String {
    map_lines(text, |line| {
        let without_anchor = HYPERTARGET_OPENER.replacen(line, 1, "");
        LABEL_WITH_STRAY_BRACE
            .replacen(&without_anchor, 1, "$1")
            .into_owned()
    })
}

fn map_lines(text: &str, mut transform: impl FnMut(&str) -> String) -> String {
    let mut output = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (body, ending) = split_line_ending(line);
        output.push_str(&transform(body));
        output.push_str(ending);
    }
    output
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}
