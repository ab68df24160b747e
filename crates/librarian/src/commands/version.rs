//! Version command.

use serde::Serialize;

#[derive(Serialize)]
struct VersionInfo {
    name: &'static str,
    version: &'static str,
}

const INFO: VersionInfo = VersionInfo {
    name: "librarian",
    version: env!("CARGO_PKG_VERSION"),
};

/// Print `librarian <version>`.
pub fn cmd_version(global_json: bool) -> anyhow::Result<()> {
    if global_json {
        println!("{}", serde_json::to_string_pretty(&INFO)?);
    } else {
        println!("{} {}", INFO.name, INFO.version);
    }
    Ok(())
}
