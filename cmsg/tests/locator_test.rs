use cmsg::error::CmsgError;
use cmsg::locator;
use std::io::Write;

#[test]
fn list_round_trips_through_dedup_and_reconstruction() {
    let input = "cMsg:cMsg://h1:45000/cMsg/x;cmsg://h2:45000/cMsg/x;CMSG:cmsg://h1:45000/cMsg/x";
    let resolved = locator::resolve(input).unwrap();

    // The duplicate of h1 is dropped, order is preserved.
    assert_eq!(resolved.entries.len(), 2);
    assert_eq!(resolved.entries[0].remainder, "h1:45000/cMsg/x");
    assert_eq!(resolved.entries[1].remainder, "h2:45000/cMsg/x");
    assert_eq!(
        resolved.canonical,
        "cMsg:cMsg://h1:45000/cMsg/x;cMsg:cMsg://h2:45000/cMsg/x"
    );

    // Re-parsing the canonical form reproduces the same set.
    let again = locator::resolve(&resolved.canonical).unwrap();
    assert_eq!(again.entries, resolved.entries);
    assert_eq!(again.canonical, resolved.canonical);
}

#[test]
fn mixed_domains_in_one_list_are_refused() {
    let err = locator::resolve("cMsg:cMsg://h1/cMsg/x;cMsg:rc://h2/?expid=e").unwrap_err();
    assert_eq!(err, CmsgError::WrongDomainType);
}

#[test]
fn config_file_expands_one_level() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# a comment line").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "not a locator").unwrap();
    writeln!(file, "  cMsg:cMsg://stored:45000/cMsg/fromFile  ").unwrap();
    file.flush().unwrap();

    let input = format!("cMsg:configFile://{}", file.path().display());
    let resolved = locator::resolve(&input).unwrap();
    assert_eq!(resolved.domain, "cMsg");
    assert_eq!(resolved.entries.len(), 1);
    assert_eq!(resolved.entries[0].remainder, "stored:45000/cMsg/fromFile");
}

#[test]
fn config_file_splices_lists_in_place() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "cMsg:cMsg://a:45000/cMsg/x;cMsg:cMsg://b:45000/cMsg/y").unwrap();
    file.flush().unwrap();

    let input = format!(
        "cMsg:cMsg://first:45000/cMsg/z;configFile://{}",
        file.path().display()
    );
    let resolved = locator::resolve(&input).unwrap();
    let remainders: Vec<&str> = resolved
        .entries
        .iter()
        .map(|e| e.remainder.as_str())
        .collect();
    assert_eq!(
        remainders,
        ["first:45000/cMsg/z", "a:45000/cMsg/x", "b:45000/cMsg/y"]
    );
}

#[test]
fn config_file_referencing_config_file_is_bad_format() {
    let mut inner = tempfile::NamedTempFile::new().unwrap();
    writeln!(inner, "cMsg:cMsg://real:45000/cMsg/x").unwrap();
    inner.flush().unwrap();

    let mut outer = tempfile::NamedTempFile::new().unwrap();
    writeln!(outer, "cMsg:configFile://{}", inner.path().display()).unwrap();
    outer.flush().unwrap();

    let input = format!("cMsg:configFile://{}", outer.path().display());
    assert_eq!(locator::resolve(&input).unwrap_err(), CmsgError::BadFormat);
}

#[test]
fn missing_config_file_is_an_error() {
    let err = locator::resolve("configFile:///no/such/file/anywhere").unwrap_err();
    assert_eq!(err, CmsgError::Error);
}
