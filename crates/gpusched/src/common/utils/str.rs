use std::borrow::Cow;
use std::fmt::Display;

/// Return the input string with an added "s" at the end if `count` is larger than one and non-zero.
pub fn pluralize(value: &str, count: usize) -> Cow<'_, str> {
    if count == 1 {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("{value}s"))
    }
}

pub fn format_comma_delimited<I: IntoIterator<Item = T>, T: Display>(values: I) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Wraps the value in single quotes, escaping embedded quotes for POSIX shells.
pub fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quotes the value only if a POSIX shell would otherwise split or expand it.
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(single_quote(value))
    }
}

/// Joins arguments into a single command line that a shell splits back into the same words.
pub fn shell_join<I: IntoIterator<Item = T>, T: AsRef<str>>(args: I) -> String {
    args.into_iter()
        .map(|arg| shell_quote(arg.as_ref()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use crate::common::utils::str::{format_comma_delimited, pluralize, shell_join, shell_quote};

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("GPU", 1), "GPU");
        assert_eq!(pluralize("GPU", 0), "GPUs");
        assert_eq!(pluralize("GPU", 3), "GPUs");
    }

    #[test]
    fn test_comma_delimited() {
        assert_eq!(format_comma_delimited(Vec::<u32>::new()), "");
        assert_eq!(format_comma_delimited([3]), "3");
        assert_eq!(format_comma_delimited([0, 2, 5]), "0,2,5");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("train.py"), "train.py");
        assert_eq!(shell_quote("--lr=0.1"), "--lr=0.1");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_shell_join_keeps_words() {
        assert_eq!(
            shell_join(["python", "-c", "print(1)"]),
            "python -c 'print(1)'"
        );
        assert_eq!(
            shell_join(vec!["echo".to_string(), "two words".to_string(), "x;y".to_string()]),
            "echo 'two words' 'x;y'"
        );
    }
}
