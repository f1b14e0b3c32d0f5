//! # Shell Completion Module
//!
//! Shell completion support for Resonance:
//! - Generation of completion scripts through `clap_complete`
//! - Dynamic completion of strategy names
//!
//! ## Usage
//!
//! ```bash
//! # Generate bash completions
//! resonance completion bash > ~/.local/share/bash-completion/completions/resonance
//!
//! # Generate zsh completions
//! resonance completion zsh > ~/.config/zsh/completions/_resonance
//! ```

use crate::cli::Shell;
use crate::model::StrategyKind;
use clap::Command;
use clap_complete::{generate, Generator, Shell as CompletionShell};
use std::io::{self, Write};

/// Generate shell completions for the given shell
pub fn generate_completions<G: Generator>(gen: G, cmd: &mut Command) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut io::stdout());
}

/// Convert our Shell enum to clap_complete's Shell enum
#[must_use]
pub fn shell_to_completion_shell(shell: Shell) -> CompletionShell {
    match shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    }
}

/// Strategy names accepted by `--strategy`, canonical names first.
#[must_use]
pub fn strategy_completions() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = StrategyKind::ALL.iter().map(|kind| kind.as_str()).collect();
    names.extend(["content-based", "embedding-semantic", "hybrid-rerank"]);
    names
}

/// Print strategy names, one per line, for shell completion scripts.
pub fn print_strategy_completions<W: Write>(out: &mut W) -> io::Result<()> {
    for name in strategy_completions() {
        writeln!(out, "{name}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_conversion() {
        assert_eq!(shell_to_completion_shell(Shell::Bash), CompletionShell::Bash);
        assert_eq!(shell_to_completion_shell(Shell::Zsh), CompletionShell::Zsh);
    }

    #[test]
    fn test_strategy_completions_all_parse() {
        for name in strategy_completions() {
            assert!(name.parse::<StrategyKind>().is_ok(), "{name} should parse");
        }
    }

    #[test]
    fn test_print_strategy_completions() {
        let mut out = Vec::new();
        print_strategy_completions(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().any(|line| line == "hybrid-rerank"));
        assert_eq!(text.lines().count(), 7);
    }
}
