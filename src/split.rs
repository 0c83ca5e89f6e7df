//! Splits a text buffer into top-level bracketed expressions.

const OPEN: char = '{';
const CLOSE: char = '}';
const QUOTE: char = '"';
const ESCAPE: char = '\\';

/// Splits every non-empty line of `buffer` into its top-level expressions,
/// preserving order.
pub fn split_queries(buffer: &str) -> Vec<String> {
    buffer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .flat_map(split_expressions)
        .collect()
}

/// Splits one line into top-level expressions.
///
/// Brackets inside quoted strings are not structural. A line with no
/// complete expression is returned whole.
pub fn split_expressions(line: &str) -> Vec<String> {
    let mut expressions = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for ch in line.chars() {
        current.push(ch);

        if escaped {
            escaped = false;
            continue;
        }

        match ch {
            ESCAPE => escaped = true,
            QUOTE => in_string = !in_string,
            _ if in_string => {}
            OPEN => depth += 1,
            CLOSE => {
                depth -= 1;
                if depth == 0 {
                    push_trimmed(&mut expressions, &current);
                    current.clear();
                }
            }
            _ => {}
        }
    }
    push_trimmed(&mut expressions, &current);

    if expressions.is_empty() {
        vec![line.to_owned()]
    } else {
        expressions
    }
}

fn push_trimmed(expressions: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        expressions.push(trimmed.to_owned());
    }
}
