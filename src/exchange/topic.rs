//! Topic routing-key matching.
//!
//! Patterns and routing keys are dot separated words. A pattern word of `#`
//! matches every remaining word, including none. Inside a word, `*` matches
//! exactly one character and `#` matches the rest of the word, so `*` only
//! stands for a whole word when that word is a single character.

pub fn topic_match(pattern: &str, routing_key: &str) -> bool {
    let mut words = routing_key.split('.');

    for part in pattern.split('.') {
        if part == "#" {
            return true;
        }

        match words.next() {
            Some(word) if word_match(part, word) => {}
            _ => return false,
        }
    }

    words.next().is_none()
}

fn word_match(pattern: &str, word: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }

    let mut chars = word.chars();

    for p in pattern.chars() {
        match p {
            '#' => return true,
            '*' => {
                if chars.next().is_none() {
                    return false;
                }
            }
            literal => {
                if chars.next() != Some(literal) {
                    return false;
                }
            }
        }
    }

    chars.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::topic_match;

    #[test]
    fn matches() {
        for (pattern, key) in [
            ("a", "a"),
            ("ab", "ab"),
            ("#", "a"),
            ("#", "aa"),
            ("#", "aaaaaaaaaaaaaaaaaaaaaaaaa"),
            ("#", "a.b.c"),
            ("#.a", "bbbb.a"),
            ("teste#", "testeb"),
            ("teste#", "testebbbbbbbbbbb"),
            ("*.*", "a.b"),
            ("*a", "aa"),
            ("*aa", "baa"),
            ("a*.b*", "ab.ba"),
            ("a.#", "a"),
            ("a.#", "a.b.c"),
            ("maps.layer.stored", "maps.layer.stored"),
            ("maps.layer.#", "maps.layer.bleh"),
        ] {
            assert!(topic_match(pattern, key), "{pattern} should match {key}");
        }
    }

    #[test]
    fn mismatches() {
        for (pattern, key) in [
            ("", "a"),
            ("a", "b"),
            ("a", "a.b"),
            ("a.b", "a"),
            ("*", "aa"),
            ("a*", "aaa"),
            ("*.*", "a"),
            ("maps.layer.*", "maps.layer.stored"),
        ] {
            assert!(
                !topic_match(pattern, key),
                "{pattern} should not match {key}"
            );
        }
    }
}
