//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Renders the permission bits of `mode` the way `ls -l` does.
///
/// ## Examples
///
/// ```
/// use dlrootfs::utils::format_mode;
///
/// assert_eq!(format_mode(0o644), "rw-r--r--");
/// assert_eq!(format_mode(0o4755), "rwsr-xr-x");
/// assert_eq!(format_mode(0o1777), "rwxrwxrwt");
/// ```
pub fn format_mode(mode: u32) -> String {
    let bit = |mask: u32, c: char| if mode & mask != 0 { c } else { '-' };
    let special = |exec: bool, special: bool, set: char| match (exec, special) {
        (true, true) => set,
        (false, true) => set.to_ascii_uppercase(),
        (true, false) => 'x',
        (false, false) => '-',
    };

    [
        bit(0o400, 'r'),
        bit(0o200, 'w'),
        special(mode & 0o100 != 0, mode & 0o4000 != 0, 's'),
        bit(0o040, 'r'),
        bit(0o020, 'w'),
        special(mode & 0o010 != 0, mode & 0o2000 != 0, 's'),
        bit(0o004, 'r'),
        bit(0o002, 'w'),
        special(mode & 0o001 != 0, mode & 0o1000 != 0, 't'),
    ]
    .iter()
    .collect()
}
