//! Module containing terminal utilities

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Determines if the process is running in an interactive terminal environment
pub fn is_interactive_terminal() -> bool {
    let stdin_is_tty = unsafe { libc::isatty(libc::STDIN_FILENO) == 1 };
    let stdout_is_tty = unsafe { libc::isatty(libc::STDOUT_FILENO) == 1 };

    stdin_is_tty && stdout_is_tty
}

/// Determines if the process is running in an interactive terminal that renders ANSI escapes.
///
/// A `TERM` of `dumb` or a set `NO_COLOR` disables styling even on a TTY.
pub fn is_ansi_interactive_terminal() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }

    match std::env::var("TERM") {
        Ok(term) if term == "dumb" => false,
        Ok(_) => is_interactive_terminal(),
        Err(_) => {
            tracing::debug!("detected no TERM environment variable, disabling ansi styles");
            false
        }
    }
}
