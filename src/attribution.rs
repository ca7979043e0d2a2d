use std::collections::BTreeSet;

// Return the configured people related to a process.
//
// A person is related when any single part of their name appears,
// case-insensitively, in the command line or in the working directory.
// One matching name part is enough, so short names like "li" will
// match unrelated paths. This is a known false-positive source.
pub fn attribute(cmd: &str, pwd: &str, people: &[String]) -> BTreeSet<String> {
    let cmd = cmd.to_lowercase();
    let pwd = pwd.to_lowercase();

    people
        .iter()
        .filter(|person| {
            person
                .split_whitespace()
                .map(str::to_lowercase)
                .any(|part| cmd.contains(&part) || pwd.contains(&part))
        })
        .cloned()
        .collect()
}
