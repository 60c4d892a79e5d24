use arbor_pointer::{
    escape_segment, format_pointer, join_pointer, parse_pointer, rebase_pointer, unescape_segment,
    PointerError,
};

#[test]
fn parse_pointer_matrix() {
    assert_eq!(parse_pointer("").unwrap(), Vec::<String>::new());
    assert_eq!(parse_pointer("/").unwrap(), vec![String::new()]);
    assert_eq!(
        parse_pointer("/foo/bar").unwrap(),
        vec!["foo".to_string(), "bar".to_string()]
    );
    assert_eq!(
        parse_pointer("/a~0b/c~1d/1").unwrap(),
        vec!["a~b".to_string(), "c/d".to_string(), "1".to_string()]
    );
    assert_eq!(
        parse_pointer("foo/bar"),
        Err(PointerError::NotAbsolute("foo/bar".to_string()))
    );
}

#[test]
fn format_pointer_matrix() {
    assert_eq!(format_pointer::<&str>(&[]), "");
    assert_eq!(format_pointer(&[""]), "/");
    assert_eq!(format_pointer(&["foo", "bar"]), "/foo/bar");
    assert_eq!(format_pointer(&["a~b", "c/d", "1"]), "/a~0b/c~1d/1");
}

#[test]
fn escape_unescape_matrix() {
    assert_eq!(unescape_segment("foobar"), "foobar");
    assert_eq!(unescape_segment("foo~0~1"), "foo~/");
    assert_eq!(escape_segment("foobar"), "foobar");
    assert_eq!(escape_segment("foo~/"), "foo~0~1");
}

#[test]
fn join_pointer_escapes() {
    assert_eq!(join_pointer("", "to"), "/to");
    assert_eq!(join_pointer("/todos", "0"), "/todos/0");
    assert_eq!(join_pointer("/m", "a/b"), "/m/a~1b");
}

#[test]
fn rebase_pointer_matrix() {
    assert_eq!(rebase_pointer("", "/a/b"), Some("/a/b".to_string()));
    assert_eq!(rebase_pointer("/a", "/a/b"), Some("/b".to_string()));
    assert_eq!(rebase_pointer("/a", "/a"), Some(String::new()));
    assert_eq!(rebase_pointer("/a", "/ab"), None);
    assert_eq!(rebase_pointer("/a/b", "/a"), None);
}
