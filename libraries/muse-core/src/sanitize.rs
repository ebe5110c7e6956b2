//! Filename sanitisation
//!
//! Shared by the byte cache (track-id derived stems) and the offline
//! library ("Artist - Title" naming).

/// Replace filesystem-reserved characters with `_`, collapse runs of
/// whitespace to a single space, and trim.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            _ => c,
        })
        .collect();

    let mut out = String::with_capacity(replaced.len());
    let mut last_was_space = false;
    for c in replaced.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }

    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_reserved_characters() {
        assert_eq!(sanitize_filename("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn collapses_and_trims_whitespace() {
        assert_eq!(sanitize_filename("  AC  /  DC  "), "AC _ DC");
        assert_eq!(sanitize_filename("one\t\ttwo\nthree"), "one two three");
    }

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(sanitize_filename("Plain Name-01"), "Plain Name-01");
    }
}
