//! RDFox shell script and command line construction.
//!
//! Script lines are written into a reserved file in the sandbox and executed by
//! RDFox's `sandbox` mode, so every relative path in the script resolves inside
//! the working directory.

use crate::core::types::CommandSpec;

/// Reserved input name holding the generated script.
pub const MASTER_SCRIPT: &str = "__master.rdfox";

/// Executable used when neither config nor environment name one.
pub const DEFAULT_EXECUTABLE: &str = "RDFox";

/// Join script lines into the master script, one command per line.
pub fn master_script<S: AsRef<str>>(lines: &[S]) -> String {
    let mut script = String::new();
    for line in lines {
        script.push_str(line.as_ref());
        script.push('\n');
    }
    script
}

/// Ensure the script ends with `quit` so the shell exits when it is done.
pub fn with_quit<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    let mut out: Vec<String> = lines.iter().map(|l| l.as_ref().to_string()).collect();
    let ends_with_quit = out
        .iter()
        .rev()
        .find(|l| !l.trim().is_empty())
        .is_some_and(|l| l.trim() == "quit");
    if !ends_with_quit {
        out.push("quit".to_string());
    }
    out
}

/// `<exe> sandbox . "exec __master.rdfox"`.
pub fn rdfox_command(executable: &str) -> CommandSpec {
    CommandSpec::new(executable)
        .arg("sandbox")
        .arg(".")
        .arg(format!("exec {MASTER_SCRIPT}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_script_is_newline_terminated() {
        let script = master_script(&["dstore create default", "import facts.ttl"]);
        assert_eq!(script, "dstore create default\nimport facts.ttl\n");
    }

    #[test]
    fn with_quit_appends_only_when_missing() {
        assert_eq!(with_quit(&["import a.ttl"]), vec!["import a.ttl", "quit"]);
        assert_eq!(with_quit(&["import a.ttl", "quit", ""]), vec!["import a.ttl", "quit", ""]);
    }

    #[test]
    fn command_runs_master_script_in_sandbox() {
        let cmd = rdfox_command("RDFox");
        assert_eq!(cmd.to_string(), "RDFox sandbox . exec __master.rdfox");
    }
}
