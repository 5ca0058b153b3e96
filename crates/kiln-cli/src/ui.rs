//! Console reporter.
//!
//! Progress goes to stderr so stdout stays clean for scripting; caveats go
//! to stdout because they are the command's user-facing product.

use kiln_core::Reporter;
use kiln_schema::{PackageName, Version};

/// Plain-text reporter for interactive use.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn fetching(&self, name: &PackageName, version: &Version, url: &str) {
        eprintln!("==> Fetching {name} {version} ({url})");
    }

    fn building(&self, name: &PackageName, version: &Version) {
        eprintln!("==> Building {name} {version}");
    }

    fn done(&self, name: &PackageName, version: &Version, detail: &str) {
        eprintln!("==> {name} {version}: {detail}");
    }

    fn failed(&self, name: &PackageName, version: &Version, reason: &str) {
        eprintln!("==> {name} {version} failed: {reason}");
    }

    fn caveat(&self, name: &PackageName, text: &str) {
        println!("==> Caveats for {name}");
        for line in text.lines() {
            println!("    {line}");
        }
    }

    fn info(&self, msg: &str) {
        eprintln!("{msg}");
    }

    fn warning(&self, msg: &str) {
        eprintln!("warning: {msg}");
    }
}
