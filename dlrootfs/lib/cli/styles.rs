use clap::builder::styling::{AnsiColor, Effects, Style, Styles};
use std::fmt::Write;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

#[cfg(not(test))]
/// Whether stderr is an ANSI-capable interactive terminal.
static IS_ANSI_TERMINAL: std::sync::LazyLock<bool> =
    std::sync::LazyLock::new(dlutils::is_ansi_interactive_terminal);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the styles used by the help output and the messages printed by `dlrootfs`.
pub fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
        .valid(AnsiColor::Green.on_default() | Effects::BOLD)
}

fn apply_style(text: String, style: &Style) -> String {
    #[cfg(not(test))]
    if !*IS_ANSI_TERMINAL {
        return text;
    }

    #[cfg(test)]
    {
        if std::env::var("TERM").unwrap_or_default() == "dumb" {
            return text;
        }
    }

    let mut styled = String::with_capacity(text.len() + 20);
    let _ = write!(styled, "{}", style);
    styled.push_str(&text);
    let _ = write!(styled, "{}", style.render_reset());
    styled
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Applies the [`styles`] palette to text.
pub trait AnsiStyles {
    /// Style for image references and paths.
    fn literal(&self) -> String;

    /// Style for warnings.
    fn error(&self) -> String;

    /// Style for success messages.
    fn valid(&self) -> String;
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl AnsiStyles for String {
    fn literal(&self) -> String {
        apply_style(self.clone(), styles().get_literal())
    }

    fn error(&self) -> String {
        apply_style(self.clone(), styles().get_error())
    }

    fn valid(&self) -> String {
        apply_style(self.clone(), styles().get_valid())
    }
}

impl AnsiStyles for &str {
    fn literal(&self) -> String {
        self.to_string().literal()
    }

    fn error(&self) -> String {
        self.to_string().error()
    }

    fn valid(&self) -> String {
        self.to_string().valid()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_ansi_styles_plain_on_dumb_terminal() {
        helper::set_term("dumb");

        assert_eq!("rootfs".literal(), "rootfs");
        assert_eq!(String::from("warning").error(), "warning");
        assert_eq!("done".valid(), "done");
    }

    #[test]
    #[serial]
    fn test_ansi_styles_colored_on_ansi_terminal() {
        helper::set_term("xterm-256color");

        let literal = "rootfs".literal();
        assert!(literal.contains("\x1b[34m"));
        assert!(literal.contains("rootfs"));
        assert!(literal.ends_with("\x1b[0m"));

        let error = "warning".error();
        assert!(error.contains("\x1b[1m"));
        assert!(error.contains("\x1b[31m"));
    }

    mod helper {
        pub(super) fn set_term(term: &str) {
            std::env::set_var("TERM", term);
        }
    }
}
