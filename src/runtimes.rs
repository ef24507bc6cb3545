//! Runtime environment catalog.
//!
//! Maps a declared runtime name (e.g. `python:3.10`) to the container image
//! and package tooling that back it. Validation rejects anything not listed
//! here, which also keeps runtime names from reaching pod specs unchecked.

/// A supported runtime environment
pub struct RuntimeEnvironment {
    /// Name clients declare, e.g. "python:3.10"
    pub name: &'static str,
    /// Container image backing the runtime
    pub image: &'static str,
    /// Language family, used for package tooling
    pub family: &'static str,
    /// Command prefix that installs packages inside the pod, if any
    pub install_prefix: &'static [&'static str],
}

/// All supported runtimes
const RUNTIMES: &[RuntimeEnvironment] = &[
    RuntimeEnvironment {
        name: "python:3.10",
        image: "python:3.10-slim",
        family: "python",
        install_prefix: &["pip", "install", "--no-cache-dir"],
    },
    RuntimeEnvironment {
        name: "python:3.11",
        image: "python:3.11-slim",
        family: "python",
        install_prefix: &["pip", "install", "--no-cache-dir"],
    },
    RuntimeEnvironment {
        name: "python:3.12",
        image: "python:3.12-slim",
        family: "python",
        install_prefix: &["pip", "install", "--no-cache-dir"],
    },
    RuntimeEnvironment {
        name: "node:18",
        image: "node:18-alpine",
        family: "node",
        install_prefix: &["npm", "install", "-g"],
    },
    RuntimeEnvironment {
        name: "node:20",
        image: "node:20-alpine",
        family: "node",
        install_prefix: &["npm", "install", "-g"],
    },
    RuntimeEnvironment {
        name: "node:22",
        image: "node:22-alpine",
        family: "node",
        install_prefix: &["npm", "install", "-g"],
    },
    RuntimeEnvironment {
        name: "go:1.23",
        image: "golang:1.23-alpine",
        family: "go",
        install_prefix: &[],
    },
    RuntimeEnvironment {
        name: "rust:1.85",
        image: "rust:1.85-alpine",
        family: "rust",
        install_prefix: &[],
    },
    RuntimeEnvironment {
        name: "ruby:3.3",
        image: "ruby:3.3-alpine",
        family: "ruby",
        install_prefix: &["gem", "install"],
    },
    RuntimeEnvironment {
        name: "base",
        image: "ubuntu:24.04",
        family: "base",
        install_prefix: &[],
    },
];

/// Resolve a declared runtime name to its environment.
pub fn resolve(name: &str) -> Option<&'static RuntimeEnvironment> {
    RUNTIMES.iter().find(|r| r.name == name)
}

/// True when the runtime name is in the catalog.
pub fn is_known(name: &str) -> bool {
    resolve(name).is_some()
}

/// Names of all supported runtimes, for error messages.
pub fn known_names() -> Vec<&'static str> {
    RUNTIMES.iter().map(|r| r.name).collect()
}

/// Shell command installing the given packages for a runtime, if its family
/// has package tooling.
pub fn install_command(runtime: &RuntimeEnvironment, packages: &[String]) -> Option<Vec<String>> {
    if runtime.install_prefix.is_empty() || packages.is_empty() {
        return None;
    }
    let mut cmd: Vec<String> = runtime.install_prefix.iter().map(|s| s.to_string()).collect();
    cmd.extend(packages.iter().cloned());
    Some(cmd)
}
