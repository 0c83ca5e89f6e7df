//! Canonical spacing for bracketed query expressions.

const OPEN: char = '{';
const QUOTE: char = '"';
const ESCAPE: char = '\\';

/// Formats every non-empty line of `buffer` and rejoins them with newlines.
pub fn format_queries(buffer: &str) -> String {
    buffer
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(format_expression)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Rewrites one expression into canonical spacing:
/// `{join,{scan,a},b}` becomes `{join, {scan, a}, b}`.
///
/// Text inside quoted strings is copied unchanged.
pub fn format_expression(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len() + expr.len() / 4);
    let mut in_string = false;
    let mut last: Option<char> = None;

    for ch in expr.chars() {
        if ch == QUOTE && last != Some(ESCAPE) {
            in_string = !in_string;
        }

        if in_string {
            out.push(ch);
        } else {
            match ch {
                OPEN => {
                    if !matches!(last, None | Some(OPEN | ',' | ' ')) {
                        out.push(' ');
                    }
                    out.push(ch);
                }
                ',' => out.push_str(", "),
                ' ' => {
                    if !matches!(last, Some(' ' | ',' | OPEN)) {
                        out.push(ch);
                    }
                }
                _ => out.push(ch),
            }
        }

        last = Some(ch);
    }

    out.trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::{format_expression, format_queries};

    #[test]
    fn canonical_join() {
        assert_eq!(
            format_expression("{join,{scan,employees},{scan,departments},dept_id}"),
            "{join, {scan, employees}, {scan, departments}, dept_id}"
        );
    }

    #[test]
    fn collapses_extra_spaces() {
        assert_eq!(
            format_expression("{ take ,   {scan,  naturals},25 }"),
            "{take , {scan, naturals}, 25 }"
        );
    }

    #[test]
    fn separates_adjacent_expressions() {
        assert_eq!(format_expression("{scan, a}{scan, b}"), "{scan, a} {scan, b}");
    }

    #[test]
    fn strings_are_untouched() {
        assert_eq!(
            format_expression(r#"{eq,name,"a,{b}  c"}"#),
            r#"{eq, name, "a,{b}  c"}"#
        );
        assert_eq!(
            format_expression(r#"{eq,name,"say \"hi,{x}\""}"#),
            r#"{eq, name, "say \"hi,{x}\""}"#
        );
    }

    #[test]
    fn format_is_idempotent() {
        for input in [
            "{join,{scan,employees},{scan,departments},dept_id}",
            "{ take ,   {scan,  naturals},25 }",
            "{scan, a}{scan,b}",
            r#"{eq,name,"a,{b}  c"}"#,
            "{project,{scan,employees} ,  [name,id]}",
        ] {
            let once = format_expression(input);
            assert_eq!(format_expression(&once), once, "input: {input}");
        }
    }

    #[test]
    fn buffer_drops_blank_lines() {
        assert_eq!(
            format_queries("{scan,a}\n\n   \n  {scan,b}  \n"),
            "{scan, a}\n{scan, b}"
        );
    }
}
