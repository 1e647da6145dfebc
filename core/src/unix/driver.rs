//! Per-flavor enumeration drivers for Unix hosts.
//!
//! Each driver translates a condition list into one native `find`
//! invocation with a fixed-format metadata directive, and parses the
//! resulting records back into [`FileInfo`] snapshots. The grammar differs
//! enough per flavor to warrant one driver each:
//!
//! - **Linux**: GNU find; `-printf` emits every field in one pass,
//!   NUL-delimited (NUL cannot appear in a filename);
//! - **macOS**: BSD find (`-E` for extended regex, no `-printf`); matches
//!   are piped through `xargs ls -ldnT`;
//! - **Solaris**: no `-maxdepth`; the depth bound is emulated with an
//!   `awk` field count over the path separators, and matches go through
//!   `xargs ls -dnE`.

use chrono::{DateTime, Utc};

use crate::errors::SearchError;
use crate::fs::{FileExt, FileInfo, FileType, Mount, PosixExt};
use crate::search::{
    unsupported, Condition, Field, Op, DEPTH_UNLIMITED, FILETYPE_DIR, FILETYPE_FILE,
    FILETYPE_LINK,
};

/// Patterns equal to this match everything and are omitted from commands.
const WILDCARD: &str = ".*";

/// Flavor-specific command synthesis and record parsing.
pub(crate) enum UnixDriver {
    Linux {
        /// SELinux hosts report a security context as an extra field.
        selinux: bool,
    },
    MacOs,
    Solaris,
}

/// Condition list digested into the shape every `find` grammar consumes.
struct FindParams {
    from: String,
    depth: i64,
    dir_only: bool,
    follow_links: bool,
    xdev: bool,
    fs_type: Option<String>,
    path_re: Option<String>,
    dirname_re: Option<String>,
    basename_re: Option<String>,
    basename_eq: Option<String>,
    basename_ne: Option<String>,
    basename_any: Option<Vec<String>>,
    basename_none: Option<Vec<String>>,
    perm: Option<String>,
    uid: Option<i64>,
    gid: Option<i64>,
}

/// What a given driver's grammar can express beyond the common core.
struct DriverCaps {
    ownership_filters: bool,
    name_lists: bool,
}

impl FindParams {
    fn extract(conditions: &[Condition], caps: &DriverCaps) -> Result<Self, SearchError> {
        let mut params = FindParams {
            from: "/".to_string(),
            depth: DEPTH_UNLIMITED,
            dir_only: false,
            follow_links: false,
            xdev: false,
            fs_type: None,
            path_re: None,
            dirname_re: None,
            basename_re: None,
            basename_eq: None,
            basename_ne: None,
            basename_any: None,
            basename_none: None,
            perm: None,
            uid: None,
            gid: None,
        };
        for condition in conditions {
            match (condition.field(), condition.op()) {
                (Field::From, Op::Equals) => {
                    let from = condition
                        .as_str_value()
                        .ok_or_else(|| unsupported(condition))?;
                    // Spaces are escaped rather than quoted so the value can
                    // sit unadorned in the command line.
                    params.from = from.replace(' ', "\\ ");
                }
                (Field::Depth, Op::Equals) => {
                    params.depth = condition.as_int().ok_or_else(|| unsupported(condition))?;
                }
                (Field::FileType, Op::Equals) => match condition.as_str_value() {
                    Some(FILETYPE_DIR) => params.dir_only = true,
                    Some(FILETYPE_FILE) => {}
                    Some(FILETYPE_LINK) => return Err(unsupported(condition)),
                    _ => return Err(unsupported(condition)),
                },
                (Field::FollowLinks, Op::Equals) => params.follow_links = true,
                (Field::Xdev, Op::Equals) => params.xdev = true,
                (Field::FsType, Op::Equals) => {
                    params.fs_type = Some(
                        condition
                            .as_str_value()
                            .ok_or_else(|| unsupported(condition))?
                            .to_string(),
                    );
                }
                (Field::Path, Op::Match) => {
                    params.path_re = Some(regex_text(condition)?);
                }
                (Field::Dirname, Op::Match) => {
                    params.dirname_re = Some(regex_text(condition)?);
                }
                (Field::Basename, Op::Match) => {
                    params.basename_re = Some(regex_text(condition)?);
                }
                (Field::Basename, Op::Equals) => {
                    params.basename_eq = Some(str_value(condition)?);
                }
                (Field::Basename, Op::NotEquals) => {
                    params.basename_ne = Some(str_value(condition)?);
                }
                (Field::Basename, Op::AnyOf) if caps.name_lists => {
                    params.basename_any = Some(list_value(condition)?);
                }
                (Field::Basename, Op::NoneOf) if caps.name_lists => {
                    params.basename_none = Some(list_value(condition)?);
                }
                (Field::Perm, Op::Equals) if caps.ownership_filters => {
                    params.perm = Some(str_value(condition)?);
                }
                (Field::User, Op::Equals) if caps.ownership_filters => {
                    params.uid = Some(condition.as_int().ok_or_else(|| unsupported(condition))?);
                }
                (Field::Group, Op::Equals) if caps.ownership_filters => {
                    params.gid = Some(condition.as_int().ok_or_else(|| unsupported(condition))?);
                }
                _ => return Err(unsupported(condition)),
            }
        }
        Ok(params)
    }

    /// `\( -name 'a' -o -name 'b' \)`, negated for a none-of list.
    fn name_list_expr(names: &[String], negate: bool) -> String {
        let mut expr = String::new();
        if negate {
            expr.push_str(" !");
        }
        expr.push_str(" \\(");
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                expr.push_str(" -o");
            }
            expr.push_str(&format!(" -name '{name}'"));
        }
        expr.push_str(" \\)");
        expr
    }
}

fn regex_text(condition: &Condition) -> Result<String, SearchError> {
    condition
        .as_regex()
        .map(|r| r.as_str().to_string())
        .ok_or_else(|| unsupported(condition))
}

fn str_value(condition: &Condition) -> Result<String, SearchError> {
    condition
        .as_str_value()
        .map(str::to_string)
        .ok_or_else(|| unsupported(condition))
}

fn list_value(condition: &Condition) -> Result<Vec<String>, SearchError> {
    condition
        .as_list()
        .map(<[String]>::to_vec)
        .ok_or_else(|| unsupported(condition))
}

fn meaningful(pattern: &Option<String>) -> Option<&str> {
    pattern.as_deref().filter(|p| *p != WILDCARD)
}

impl UnixDriver {
    fn caps(&self) -> DriverCaps {
        match self {
            UnixDriver::Linux { .. } => DriverCaps {
                ownership_filters: true,
                name_lists: true,
            },
            UnixDriver::MacOs | UnixDriver::Solaris => DriverCaps {
                ownership_filters: false,
                name_lists: true,
            },
        }
    }

    /// The fixed-format metadata directive appended to Linux commands.
    fn printf_directive(selinux: bool) -> &'static str {
        if selinux {
            " -printf \"%M\\0%Z\\0%U\\0%G\\0%s\\0%A@\\0%C@\\0%T@\\0%p\\0%l\\n\""
        } else {
            " -printf \"%M\\0%U\\0%G\\0%s\\0%A@\\0%C@\\0%T@\\0%p\\0%l\\n\""
        }
    }

    /// Compile a condition list into one native enumeration command.
    pub(crate) fn find_command(&self, conditions: &[Condition]) -> Result<String, SearchError> {
        let params = FindParams::extract(conditions, &self.caps())?;
        match self {
            UnixDriver::Linux { selinux } => Ok(self.linux_find(&params, *selinux)),
            UnixDriver::MacOs => Ok(self.macos_find(&params)),
            UnixDriver::Solaris => Ok(self.solaris_find(&params)),
        }
    }

    /// Command that stats a single path in this driver's record format.
    pub(crate) fn stat_command(&self, path: &str) -> String {
        match self {
            UnixDriver::Linux { selinux } => {
                format!(
                    "find '{path}'{} -prune",
                    Self::printf_directive(*selinux)
                )
            }
            UnixDriver::MacOs => format!("ls -ldnT '{path}'"),
            UnixDriver::Solaris => format!("ls -dnE '{path}'"),
        }
    }

    /// Command that enumerates mount points, one per output line.
    pub(crate) fn mount_command(&self) -> &'static str {
        match self {
            UnixDriver::Linux { .. } => {
                "mount | awk '{print $3}' | xargs -I{} find {} -prune -printf \"%p %F\\n\" 2>/dev/null"
            }
            UnixDriver::MacOs => "/sbin/mount",
            UnixDriver::Solaris => "cat /etc/vfstab",
        }
    }

    /// Parse one line of [`mount_command`](Self::mount_command) output.
    pub(crate) fn parse_mount_line(&self, line: &str) -> Option<Mount> {
        match self {
            UnixDriver::Linux { .. } => {
                let mut tokens = line.split_whitespace();
                let path = tokens.next()?;
                let fs_type = tokens.next()?;
                path.starts_with('/').then(|| Mount {
                    path: path.to_string(),
                    fs_type: fs_type.to_string(),
                })
            }
            UnixDriver::MacOs => {
                // "/dev/disk1s1 on / (apfs, local, journaled)"
                let on = line.find(" on ")?;
                let rest = &line[on + 4..];
                let paren = rest.find(" (")?;
                let path = &rest[..paren];
                let attrs = &rest[paren + 2..rest.find(')')?];
                let fs_type = attrs.split(',').next()?.trim();
                path.starts_with('/').then(|| Mount {
                    path: path.to_string(),
                    fs_type: fs_type.to_string(),
                })
            }
            UnixDriver::Solaris => {
                if line.starts_with('#') {
                    return None;
                }
                let tokens: Vec<&str> = line.split_whitespace().collect();
                if tokens.len() < 4 || !tokens[2].starts_with('/') {
                    return None;
                }
                Some(Mount {
                    path: tokens[2].to_string(),
                    fs_type: tokens[3].to_string(),
                })
            }
        }
    }

    /// Parse one metadata record. `None` means the line is blank or
    /// malformed and should be skipped (the caller records a diagnostic).
    pub(crate) fn parse_record(&self, line: &str) -> Option<FileInfo> {
        match self {
            UnixDriver::Linux { selinux } => parse_nul_record(line, *selinux),
            UnixDriver::MacOs => parse_ls_record(line, LsTimeFormat::MacOs),
            UnixDriver::Solaris => parse_ls_record(line, LsTimeFormat::Solaris),
        }
    }

    fn linux_find(&self, p: &FindParams, selinux: bool) -> String {
        let printf = Self::printf_directive(selinux);
        let find = if p.follow_links { "find -L" } else { "find" };
        let mut cmd = format!("{find} {}", p.from);
        if p.xdev {
            cmd.push_str(" -mount");
        }
        if let Some(fs_type) = &p.fs_type {
            cmd.push_str(&format!(" -fstype {fs_type}"));
        }
        if p.depth != DEPTH_UNLIMITED {
            cmd.push_str(&format!(" -maxdepth {}", p.depth));
        }
        if let Some(perm) = &p.perm {
            cmd.push_str(&format!(" -perm {perm}"));
        }
        if let Some(uid) = p.uid {
            cmd.push_str(&format!(" -uid {uid}"));
        }
        if let Some(gid) = p.gid {
            cmd.push_str(&format!(" -gid {gid}"));
        }

        if p.dir_only {
            cmd.push_str(" -type d");
            if let Some(pat) = meaningful(&p.dirname_re) {
                cmd.push_str(&format!(" -regextype posix-egrep -regex '{pat}'"));
            }
            cmd.push_str(printf);
        } else if let Some(pat) = &p.path_re {
            if pat != WILDCARD {
                cmd.push_str(&format!(" -regextype posix-egrep -regex '{pat}'"));
            }
            cmd.push_str(printf);
        } else {
            if let Some(pat) = meaningful(&p.dirname_re) {
                cmd.push_str(" -type d");
                cmd.push_str(&format!(" | grep -E '{pat}'"));
                cmd.push_str(&format!(" | xargs -I{{}} {find} '{{}}' -maxdepth 1"));
            }
            cmd.push_str(" -type f");
            if let Some(pat) = &p.basename_re {
                cmd.push_str(printf);
                if pat != WILDCARD {
                    // Post-filter on the basename column of the record; the
                    // path is field 9 (SELinux shifts it to 10).
                    let path_field = if selinux { 10 } else { 9 };
                    cmd.push_str(&format!(
                        " | awk --posix -F\\\\0 '{{n=split(${path_field},a,\"/\");if(match(a[n],/{pat}/) > 0) print $0}}'"
                    ));
                }
            } else if let Some(any) = &p.basename_any {
                cmd.push_str(&FindParams::name_list_expr(any, false));
                cmd.push_str(printf);
            } else if let Some(none) = &p.basename_none {
                cmd.push_str(&FindParams::name_list_expr(none, true));
                cmd.push_str(printf);
            } else if let Some(anti) = &p.basename_ne {
                cmd.push_str(&format!(" ! -name '{anti}'"));
                cmd.push_str(printf);
            } else if let Some(name) = &p.basename_eq {
                cmd.push_str(&format!(" -name '{name}'"));
                cmd.push_str(printf);
            } else {
                cmd.push_str(printf);
            }
        }
        cmd
    }

    fn macos_find(&self, p: &FindParams) -> String {
        const STAT: &str = "ls -ldnT";
        let find = if p.follow_links { "find -L" } else { "find" };
        let mut cmd = format!("{find} -E");
        if p.xdev {
            cmd.push('x');
        }
        cmd.push_str(&format!(" {}", p.from));
        if let Some(fs_type) = &p.fs_type {
            cmd.push_str(&format!(" -fstype {fs_type}"));
        }
        if p.depth != DEPTH_UNLIMITED {
            cmd.push_str(&format!(" -maxdepth {}", p.depth));
        }

        if p.dir_only {
            cmd.push_str(" -type d");
            if let Some(pat) = meaningful(&p.dirname_re) {
                cmd.push_str(&format!(" -regex '{pat}'"));
            }
        } else if let Some(pat) = &p.path_re {
            if pat != WILDCARD {
                cmd.push_str(&format!(" -regex '{pat}'"));
            }
        } else {
            if let Some(pat) = meaningful(&p.dirname_re) {
                cmd.push_str(" -type d");
                cmd.push_str(&format!(" -regex '{pat}'"));
                cmd.push_str(&format!(" -print0 | xargs -0 -I{{}} {find} '{{}}' -maxdepth 1"));
            }
            cmd.push_str(" -type f");
            if let Some(pat) = &p.basename_re {
                cmd.push_str(&format!(" | awk -F/ '$NF ~ /{pat}/'"));
            } else if let Some(any) = &p.basename_any {
                cmd.push_str(&FindParams::name_list_expr(any, false));
            } else if let Some(none) = &p.basename_none {
                cmd.push_str(&FindParams::name_list_expr(none, true));
            } else if let Some(anti) = &p.basename_ne {
                cmd.push_str(&format!(" ! -name '{anti}'"));
            } else if let Some(name) = &p.basename_eq {
                cmd.push_str(&format!(" -name '{name}'"));
            }
        }
        cmd.push_str(&format!(" | xargs -I{{}} {STAT} '{{}}'"));
        cmd
    }

    fn solaris_find(&self, p: &FindParams) -> String {
        const STAT: &str = "ls -dnE";
        let find = if p.follow_links { "find -L" } else { "find" };
        let mut cmd = format!("{find} {}", p.from);
        if p.xdev {
            cmd.push_str(" -mount");
        }
        if let Some(fs_type) = &p.fs_type {
            cmd.push_str(&format!(" -fstype {fs_type}"));
        }

        // Solaris find has no -maxdepth; prune subtrees whose separator
        // count exceeds the bound instead. The guard is AND-ed onto a
        // directory test: directories past the bound pass the awk check and
        // get pruned.
        let depth_guard = |cmd: &mut String| {
            let bound = separator_depth(&p.from) + p.depth.max(0) as usize;
            if p.depth == 1 && p.from == "/" {
                cmd.push_str(" ! -name /");
            }
            cmd.push_str(&format!(
                " -exec sh -c 'echo $1 | awk -F/ '\\''{{if (NF > {bound}) {{exit 0}} else {{exit 1}}}}'\\''' {{}} {{}} \\; -prune"
            ));
        };

        if let Some(pat) = &p.path_re {
            cmd.push_str(" -type f");
            cmd.push_str(&format!(" | /usr/xpg4/bin/grep -E '{pat}'"));
        } else if let Some(pat) = meaningful(&p.dirname_re) {
            cmd.push_str(" -type d");
            cmd.push_str(&format!(" | /usr/xpg4/bin/grep -E '{pat}'"));
            if !p.dir_only {
                cmd.push_str(&format!(" | xargs -I[] {find} '[]' -type f"));
                if let Some(anti) = &p.basename_ne {
                    cmd.push_str(&format!(" ! -name '{anti}'"));
                } else if let Some(name) = &p.basename_eq {
                    cmd.push_str(&format!(" -name '{name}'"));
                }
                if p.depth != DEPTH_UNLIMITED {
                    // A filename can never contain NUL, so it makes a safe
                    // token between the base and the found path.
                    cmd.push_str(&format!(
                        " -exec echo []\\0 {{}} \\; | awk -F\\0 'split($1,a,\"/\")+{} >= split($2,b,\"/\"){{print substr($2,2)}}'",
                        p.depth
                    ));
                }
                if let Some(pat) = &p.basename_re {
                    cmd.push_str(&format!(" | /usr/xpg4/bin/awk -F/ '$NF ~ /{pat}/'"));
                }
            }
        } else if p.dir_only {
            cmd.push_str(" -type d");
            if p.depth != DEPTH_UNLIMITED {
                cmd.push_str(" -print");
                depth_guard(&mut cmd);
            }
        } else {
            cmd.push_str(" -type f");
            if let Some(any) = &p.basename_any {
                cmd.push_str(&FindParams::name_list_expr(any, false));
            } else if let Some(none) = &p.basename_none {
                cmd.push_str(&FindParams::name_list_expr(none, true));
            } else if let Some(name) = &p.basename_eq {
                cmd.push_str(&format!(" -name '{name}'"));
            } else if let Some(anti) = &p.basename_ne {
                cmd.push_str(&format!(" ! -name '{anti}'"));
            }
            cmd.push_str(" -print");
            if p.depth != DEPTH_UNLIMITED {
                cmd.push_str(" -o -type d");
                depth_guard(&mut cmd);
            }
            if let Some(pat) = &p.basename_re {
                cmd.push_str(&format!(" | /usr/xpg4/bin/awk -F/ '$NF ~ /{pat}/'"));
            }
        }
        cmd.push_str(&format!(" | xargs -i {STAT} '{{}}'"));
        cmd
    }
}

/// Separator-field count of a path, as `awk -F/` would see it.
fn separator_depth(path: &str) -> usize {
    if path == "/" {
        1
    } else {
        path.trim_end_matches('/').matches('/').count() + 1
    }
}

/// Parse a NUL-delimited GNU `-printf` record.
fn parse_nul_record(line: &str, selinux: bool) -> Option<FileInfo> {
    let line = line.trim_end_matches('\n');
    if line.trim().is_empty() {
        return None;
    }
    let fields: Vec<&str> = line.split('\0').collect();
    let min = if selinux { 9 } else { 8 };
    if fields.len() < min {
        return None;
    }
    let mut iter = fields.into_iter();
    let perms = iter.next()?;
    if perms.is_empty() {
        return None;
    }
    let type_char = perms.chars().next()?;
    let selinux_ctx = if selinux {
        Some(iter.next()?.to_string())
    } else {
        None
    };
    // Owner ids can be non-numeric on hosts with out-of-range mappings
    // (e.g. 4294967294 for "nobody"); report them as unknown.
    let uid = iter.next()?.parse::<i64>().unwrap_or(-1);
    let gid = iter.next()?.parse::<i64>().unwrap_or(-1);
    let length = iter.next()?.parse::<u64>().unwrap_or(0);
    let atime = parse_epoch_seconds(iter.next()?);
    let ctime = parse_epoch_seconds(iter.next()?);
    let mtime = parse_epoch_seconds(iter.next()?);
    let path = iter.next()?.to_string();
    if path.is_empty() {
        return None;
    }
    let link_target = iter.next().filter(|l| !l.is_empty()).map(str::to_string);

    let file_type = match type_char {
        'd' => FileType::Directory,
        'l' => FileType::Link,
        _ => FileType::File,
    };
    Some(FileInfo {
        file_type,
        canonical_path: path.clone(),
        path,
        link_target,
        length,
        access_time: atime,
        create_time: ctime,
        modify_time: mtime,
        ext: FileExt::Posix(PosixExt {
            permissions: perms.chars().skip(1).collect(),
            uid,
            gid,
            selinux: selinux_ctx,
        }),
    })
}

/// `%A@`-style epoch seconds with a fractional part.
fn parse_epoch_seconds(text: &str) -> Option<DateTime<Utc>> {
    let seconds: f64 = text.trim().parse().ok()?;
    DateTime::from_timestamp_millis((seconds * 1000.0) as i64)
}

enum LsTimeFormat {
    /// `ls -ldnT`: `Jan  1 12:34:56 2024`.
    MacOs,
    /// `ls -dnE`: `2024-01-01 12:34:56.000000000 +0000`.
    Solaris,
}

/// Parse one `ls -l`-style record into a metadata snapshot.
fn parse_ls_record(line: &str, format: LsTimeFormat) -> Option<FileInfo> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }
    if line.len() < 11 {
        return None;
    }
    let type_char = line.chars().next()?;
    let perms: String = line.chars().skip(1).take(9).collect();
    // Offset 10 may carry a '+' for an extended ACL; skip past it either way.
    let rest = line.get(11..)?;

    let time_tokens = match format {
        LsTimeFormat::MacOs => 4,
        LsTimeFormat::Solaris => 3,
    };
    let mut tokens = rest.split_whitespace();
    let _links = tokens.next()?;
    let uid = tokens.next()?.parse::<i64>().unwrap_or(-1);
    let gid = tokens.next()?.parse::<i64>().unwrap_or(-1);
    let length = tokens.next()?.parse::<u64>().unwrap_or(0);
    let mut time_parts = Vec::with_capacity(time_tokens);
    for _ in 0..time_tokens {
        time_parts.push(tokens.next()?);
    }
    let mtime = match format {
        LsTimeFormat::MacOs => parse_macos_time(&time_parts),
        LsTimeFormat::Solaris => parse_solaris_time(&time_parts),
    };

    // The rest of the line is the path, possibly with a link target.
    let consumed_len: usize = {
        // Re-derive the path from the original text to preserve interior
        // whitespace: find the last time token and take what follows.
        let last = time_parts.last()?;
        let idx = rest.find(last)? + last.len();
        idx
    };
    let path_part = rest.get(consumed_len..)?.trim_start();
    if path_part.is_empty() {
        return None;
    }
    let (path, link_target) = match path_part.split_once(" -> ") {
        Some((p, t)) => (p.to_string(), Some(t.to_string())),
        None => (path_part.to_string(), None),
    };

    let file_type = match type_char {
        'd' => FileType::Directory,
        'l' => FileType::Link,
        _ => FileType::File,
    };
    Some(FileInfo {
        file_type,
        canonical_path: path.clone(),
        path,
        link_target,
        length,
        access_time: None,
        create_time: None,
        modify_time: mtime,
        ext: FileExt::Posix(PosixExt {
            permissions: perms,
            uid,
            gid,
            selinux: None,
        }),
    })
}

fn parse_macos_time(parts: &[&str]) -> Option<DateTime<Utc>> {
    // Month day time year, e.g. ["Jan", "1", "12:34:56", "2024"].
    if parts.len() != 4 {
        return None;
    }
    let month = match parts[0] {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    let day: u32 = parts[1].parse().ok()?;
    let year: i32 = parts[3].parse().ok()?;
    let time = chrono::NaiveTime::parse_from_str(parts[2], "%H:%M:%S").ok()?;
    let date = chrono::NaiveDate::from_ymd_opt(year, month, day)?;
    Some(DateTime::from_naive_utc_and_offset(date.and_time(time), Utc))
}

fn parse_solaris_time(parts: &[&str]) -> Option<DateTime<Utc>> {
    // Date, time with nanoseconds, numeric zone.
    if parts.len() != 3 {
        return None;
    }
    let text = format!("{} {} {}", parts[0], parts[1], parts[2]);
    DateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f %z")
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
