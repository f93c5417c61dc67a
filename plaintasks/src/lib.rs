//! Engine for the plain-text to-do outline format: projects ending in `:`, bulleted tasks
//! (`☐` pending, `✔` done, `✘` cancelled), inline `@tags` and an archive section.
//! The core stays pure: every operation takes the line text, a `Settings` value and a
//! reference time, and hands back rewritten text plus notices.

pub mod model {
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------ Line kinds ------------------------------ */

    /// Structural role of one line, as reported by a `Classifier`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum LineKind {
        Pending,
        Completed,
        Cancelled,
        Header,
        Separator,
        Note,
        Empty,
    }

    impl LineKind {
        pub fn is_task(self) -> bool {
            matches!(self, Self::Pending | Self::Completed | Self::Cancelled)
        }

        pub fn is_finished(self) -> bool {
            matches!(self, Self::Completed | Self::Cancelled)
        }
    }

    /// Scope oracle. Answers are re-derived on every call and never cached across edits.
    pub trait Classifier {
        fn classify_line(&self, text: &str) -> LineKind;

        fn classify(&self, doc: &Document, line: usize) -> LineKind {
            doc.line(line)
                .map(|text| self.classify_line(text))
                .unwrap_or(LineKind::Empty)
        }
    }

    /* ------------------------------- Document ------------------------------- */

    /// Ordered lines of one outline file. Rendering gives back the exact input text
    /// when nothing was edited.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Document {
        lines: Vec<String>,
        crlf: bool,
        trailing_newline: bool,
    }

    impl Document {
        pub fn parse(text: &str) -> Self {
            let crlf = text.contains("\r\n");
            let trailing_newline = text.ends_with('\n');
            let body = text.strip_suffix('\n').unwrap_or(text);
            let body = if crlf {
                body.strip_suffix('\r').unwrap_or(body)
            } else {
                body
            };
            let lines = if text.is_empty() {
                Vec::new()
            } else if crlf {
                body.split("\r\n").map(str::to_string).collect()
            } else {
                body.split('\n').map(str::to_string).collect()
            };
            Self {
                lines,
                crlf,
                trailing_newline,
            }
        }

        pub fn from_lines<I, S>(lines: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                lines: lines.into_iter().map(Into::into).collect(),
                crlf: false,
                trailing_newline: true,
            }
        }

        pub fn len(&self) -> usize {
            self.lines.len()
        }

        pub fn is_empty(&self) -> bool {
            self.lines.is_empty()
        }

        pub fn line(&self, idx: usize) -> Option<&str> {
            self.lines.get(idx).map(String::as_str)
        }

        pub fn lines(&self) -> impl Iterator<Item = &str> + '_ {
            self.lines.iter().map(String::as_str)
        }

        /// Replace one line; out-of-range indices are ignored.
        pub fn set_line(&mut self, idx: usize, text: String) {
            if let Some(slot) = self.lines.get_mut(idx) {
                *slot = text;
            }
        }

        pub fn insert_lines(&mut self, at: usize, new_lines: Vec<String>) {
            let at = at.min(self.lines.len());
            self.lines.splice(at..at, new_lines);
        }

        pub fn push_line(&mut self, text: String) {
            self.lines.push(text);
        }

        pub fn remove_lines(&mut self, range: std::ops::Range<usize>) -> Vec<String> {
            let end = range.end.min(self.lines.len());
            let start = range.start.min(end);
            self.lines.drain(start..end).collect()
        }

        pub fn render(&self) -> String {
            let newline = if self.crlf { "\r\n" } else { "\n" };
            let mut out = self.lines.join(newline);
            if self.trailing_newline && !self.lines.is_empty() {
                out.push_str(newline);
            }
            out
        }
    }

    impl fmt::Display for Document {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.render())
        }
    }

    /* -------------------------------- Locale -------------------------------- */

    /// Month and weekday names used when formatting `%b %B %a %A` and when reading
    /// month names back. Passed explicitly; process locale is never consulted.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Locale {
        pub months: Vec<String>,
        pub months_short: Vec<String>,
        pub weekdays: Vec<String>,
        pub weekdays_short: Vec<String>,
    }

    impl Default for Locale {
        fn default() -> Self {
            let owned = |names: &[&str]| names.iter().map(|s| s.to_string()).collect();
            Self {
                months: owned(&[
                    "January",
                    "February",
                    "March",
                    "April",
                    "May",
                    "June",
                    "July",
                    "August",
                    "September",
                    "October",
                    "November",
                    "December",
                ]),
                months_short: owned(&[
                    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov",
                    "Dec",
                ]),
                weekdays: owned(&[
                    "Monday",
                    "Tuesday",
                    "Wednesday",
                    "Thursday",
                    "Friday",
                    "Saturday",
                    "Sunday",
                ]),
                weekdays_short: owned(&["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"]),
            }
        }
    }

    impl Locale {
        pub fn is_complete(&self) -> bool {
            self.months.len() == 12
                && self.months_short.len() == 12
                && self.weekdays.len() == 7
                && self.weekdays_short.len() == 7
        }

        /// Month number (1-based) for a full name, an abbreviation, or a prefix of at
        /// least three letters of the full name. Case-insensitive.
        pub fn month_from_name(&self, token: &str) -> Option<u32> {
            let token = token.to_lowercase();
            if token.chars().count() < 3 {
                return None;
            }
            self.months
                .iter()
                .zip(self.months_short.iter())
                .position(|(full, short)| {
                    let full = full.to_lowercase();
                    full == token || short.to_lowercase() == token || full.starts_with(&token)
                })
                .map(|idx| idx as u32 + 1)
        }

        pub fn is_weekday(&self, token: &str) -> bool {
            let token = token.to_lowercase();
            token.chars().count() >= 2
                && self
                    .weekdays
                    .iter()
                    .zip(self.weekdays_short.iter())
                    .any(|(full, short)| {
                        let full = full.to_lowercase();
                        full == token || short.to_lowercase() == token || full.starts_with(&token)
                    })
        }

        /// Rewrite a strftime format so name specifiers carry this locale's names for
        /// the given month (0-based) and weekday (0 = Monday).
        pub fn localize_format(&self, format: &str, month0: usize, weekday0: usize) -> String {
            let escape = |name: Option<&String>| name.map(|n| n.replace('%', "%%"));
            let mut out = String::with_capacity(format.len());
            let mut chars = format.chars();
            while let Some(c) = chars.next() {
                if c != '%' {
                    out.push(c);
                    continue;
                }
                let Some(spec) = chars.next() else {
                    out.push('%');
                    break;
                };
                let name = match spec {
                    'B' => escape(self.months.get(month0)),
                    'b' | 'h' => escape(self.months_short.get(month0)),
                    'A' => escape(self.weekdays.get(weekday0)),
                    'a' => escape(self.weekdays_short.get(weekday0)),
                    _ => None,
                };
                match name {
                    Some(name) => out.push_str(&name),
                    None => {
                        out.push('%');
                        out.push(spec);
                    }
                }
            }
            out
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// Date components attempted while building a timestamp. `None` marks a component
    /// that could not be read at all.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    pub struct DateParts {
        pub year: Option<i64>,
        pub month: Option<i64>,
        pub day: Option<i64>,
        pub hour: Option<i64>,
        pub minute: Option<i64>,
    }

    impl fmt::Display for DateParts {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let show = |v: Option<i64>| v.map_or_else(|| "?".to_string(), |v| v.to_string());
            write!(
                f,
                "year={}, month={}, day={}, hour={}, minute={}",
                show(self.year),
                show(self.month),
                show(self.day),
                show(self.hour),
                show(self.minute)
            )
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
    pub enum DateError {
        #[error("cannot build a date from {parts}: {reason}")]
        Construction { parts: DateParts, reason: String },
        #[error("adding {amount} day(s), {hour} hour(s) and {minute} minute(s) overflows the calendar")]
        Overflow { amount: i64, hour: i64, minute: i64 },
        #[error("{text:?} does not match date format {format:?}")]
        FormatMismatch { text: String, format: String },
    }

    /* -------------------------------- Notices -------------------------------- */

    /// Non-blocking messages surfaced to the user; an operation that emits one still
    /// completes.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum Notice {
        /// `++` had no usable `@created(...)`; the reference time was used instead.
        MissingCreatedReference { reason: String },
        /// Completed tasks cannot be cancelled.
        CancelCompleted,
        /// A `@started`/`@toggle` stamp could not be read; no elapsed time was added.
        UnreadableTimestamp { detail: String },
    }

    impl fmt::Display for Notice {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::MissingCreatedReference { reason } => {
                    write!(f, "@created date is missing or invalid ({reason}); using the reference time")
                }
                Self::CancelCompleted => f.write_str("you cannot cancel what have been done, can you?"),
                Self::UnreadableTimestamp { detail } => {
                    write!(f, "cannot compute elapsed time: {detail}")
                }
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct LineNotice {
        pub line: usize,
        #[serde(flatten)]
        pub notice: Notice,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct LineError {
        pub line: usize,
        pub error: DateError,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn document_round_trips_text() {
            for text in ["", "a\n", "a\nb", "☐ x\r\n\r\nProject:\r\n", "\n\n"] {
                assert_eq!(Document::parse(text).render(), text, "{text:?}");
            }
        }

        #[test]
        fn document_edits_lines() {
            let mut doc = Document::parse("one\ntwo\nthree\n");
            doc.set_line(1, "2".into());
            doc.insert_lines(3, vec!["four".into()]);
            let removed = doc.remove_lines(0..1);
            assert_eq!(removed, vec!["one".to_string()]);
            assert_eq!(doc.render(), "2\nthree\nfour\n");
        }

        #[test]
        fn locale_reads_month_names() {
            let locale = Locale::default();
            assert_eq!(locale.month_from_name("Sep"), Some(9));
            assert_eq!(locale.month_from_name("septem"), Some(9));
            assert_eq!(locale.month_from_name("DECEMBER"), Some(12));
            assert_eq!(locale.month_from_name("ma"), None);
            assert!(locale.is_weekday("fri"));
        }

        #[test]
        fn locale_substitutes_names_in_format() {
            let locale = Locale {
                months_short: vec!["j%n".into(); 12],
                ..Locale::default()
            };
            assert_eq!(
                locale.localize_format("%d %b %%b %A", 0, 4),
                "%d j%%n %%b Friday"
            );
        }

        #[test]
        fn construction_error_lists_attempted_parts() {
            let err = DateError::Construction {
                parts: DateParts {
                    year: Some(2017),
                    month: Some(2),
                    day: Some(29),
                    hour: Some(23),
                    minute: None,
                },
                reason: "day is out of range for month".into(),
            };
            assert_eq!(
                err.to_string(),
                "cannot build a date from year=2017, month=2, day=29, hour=23, minute=?: day is out of range for month"
            );
        }
    }
}

pub mod config {
    use crate::model::Locale;
    use crate::dates::DateOrder;
    use anyhow::{Context, Result};
    use chrono::Duration;
    use chrono::format::{Item, StrftimeItems};
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    /// User settings. Every field is optional in the TOML file.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        /// strftime format for every stamp, parentheses included.
        pub date_format: String,
        pub open_tasks_bullet: String,
        pub done_tasks_bullet: String,
        pub cancelled_tasks_bullet: String,
        /// Text between `@done`/`@cancelled` and the stamp.
        pub before_date_space: String,
        pub before_tasks_bullet_margin: usize,
        pub translate_tabs_to_spaces: bool,
        /// Text after the bullet of a new task; defaults to one space.
        pub tasks_bullet_space: Option<String>,
        /// Write the `@done`/`@cancelled` tag name before the stamp.
        pub done_tag: bool,
        /// Append `@project(...)` when archiving.
        pub project_tag: bool,
        pub archive_name: String,
        pub decimal_minutes: bool,
        /// Hours before a `@due` date counts as due soon. Zero disables it.
        pub highlight_due_soon: u32,
        pub taskpaper_compatible: bool,
        /// Tags whose short date expressions `expand` rewrites.
        pub expand_tags: Vec<String>,
        pub locale: Locale,
    }

    impl Default for Settings {
        fn default() -> Self {
            Self {
                date_format: "(%y-%m-%d %H:%M)".to_string(),
                open_tasks_bullet: "☐".to_string(),
                done_tasks_bullet: "✔".to_string(),
                cancelled_tasks_bullet: "✘".to_string(),
                before_date_space: " ".to_string(),
                before_tasks_bullet_margin: 1,
                translate_tabs_to_spaces: false,
                tasks_bullet_space: None,
                done_tag: true,
                project_tag: true,
                archive_name: "Archive:".to_string(),
                decimal_minutes: false,
                highlight_due_soon: 24,
                taskpaper_compatible: false,
                expand_tags: vec!["due".to_string()],
                locale: Locale::default(),
            }
        }
    }

    /// Bullets in effect after TaskPaper compatibility is applied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Bullets<'a> {
        pub open: &'a str,
        pub done: &'a str,
        pub cancelled: &'a str,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("failed to parse settings: {0}")]
        Parse(#[from] toml::de::Error),
        #[error("date_format {0:?} is not a valid strftime format")]
        DateFormat(String),
        #[error("{0} must not be empty")]
        EmptyBullet(&'static str),
        #[error("locale needs 12 month names, 12 short month names, 7 weekday names and 7 short weekday names")]
        Locale,
    }

    impl Settings {
        /// Read and validate a TOML settings file.
        pub fn load(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading settings {:?}", path))?;
            Self::from_toml_str(&text).with_context(|| format!("loading settings {:?}", path))
        }

        pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
            let settings: Settings = toml::from_str(text)?;
            settings.validate()?;
            Ok(settings)
        }

        pub fn validate(&self) -> Result<(), ConfigError> {
            if StrftimeItems::new(&self.date_format).any(|item| matches!(item, Item::Error)) {
                return Err(ConfigError::DateFormat(self.date_format.clone()));
            }
            for (name, value) in [
                ("open_tasks_bullet", &self.open_tasks_bullet),
                ("done_tasks_bullet", &self.done_tasks_bullet),
                ("cancelled_tasks_bullet", &self.cancelled_tasks_bullet),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::EmptyBullet(name));
                }
            }
            if !self.locale.is_complete() {
                return Err(ConfigError::Locale);
            }
            Ok(())
        }

        pub fn bullets(&self) -> Bullets<'_> {
            if self.taskpaper_compatible {
                Bullets {
                    open: "-",
                    done: "-",
                    cancelled: "-",
                }
            } else {
                Bullets {
                    open: &self.open_tasks_bullet,
                    done: &self.done_tasks_bullet,
                    cancelled: &self.cancelled_tasks_bullet,
                }
            }
        }

        pub fn before_date_space(&self) -> &str {
            if self.taskpaper_compatible {
                ""
            } else {
                &self.before_date_space
            }
        }

        /// TaskPaper always writes the tag name.
        pub fn writes_tag_name(&self) -> bool {
            self.done_tag || self.taskpaper_compatible
        }

        /// Indentation placed before the bullet of a task that opens a project body.
        pub fn before_tasks_bullet_spaces(&self) -> String {
            if !self.taskpaper_compatible && self.translate_tabs_to_spaces {
                " ".repeat(self.before_tasks_bullet_margin)
            } else {
                "\t".to_string()
            }
        }

        /// Gap written after the bullet of a new task: a tab unless tabs are
        /// translated or TaskPaper style is on.
        pub fn tasks_bullet_space(&self) -> &str {
            match self.tasks_bullet_space.as_deref() {
                Some(space) => space,
                None if self.taskpaper_compatible || self.translate_tabs_to_spaces => " ",
                None => "\t",
            }
        }

        pub fn due_soon_threshold(&self) -> Duration {
            Duration::hours(i64::from(self.highlight_due_soon))
        }

        pub fn date_order(&self) -> DateOrder {
            DateOrder::from_format(&self.date_format)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::io::Write;

        #[test]
        fn defaults_match_the_outline_format() {
            let settings = Settings::default();
            assert_eq!(settings.date_format, "(%y-%m-%d %H:%M)");
            let bullets = settings.bullets();
            assert_eq!((bullets.open, bullets.done, bullets.cancelled), ("☐", "✔", "✘"));
            assert_eq!(settings.before_date_space(), " ");
            assert_eq!(settings.before_tasks_bullet_spaces(), "\t");
            assert_eq!(settings.tasks_bullet_space(), "\t");
            assert!(settings.validate().is_ok());
        }

        #[test]
        fn bullet_space_follows_tab_translation() {
            let spaces = Settings {
                translate_tabs_to_spaces: true,
                ..Settings::default()
            };
            assert_eq!(spaces.tasks_bullet_space(), " ");
            let taskpaper = Settings {
                taskpaper_compatible: true,
                ..Settings::default()
            };
            assert_eq!(taskpaper.tasks_bullet_space(), " ");
            let configured = Settings {
                tasks_bullet_space: Some("  ".to_string()),
                translate_tabs_to_spaces: true,
                ..Settings::default()
            };
            assert_eq!(configured.tasks_bullet_space(), "  ");
        }

        #[test]
        fn partial_toml_keeps_remaining_defaults() {
            let settings = Settings::from_toml_str(
                "date_format = \"(%d-%m-%y %H:%M)\"\ndecimal_minutes = true\n",
            )
            .expect("parse settings");
            assert!(settings.decimal_minutes);
            assert_eq!(settings.done_tasks_bullet, "✔");
            assert!(settings.date_order().dayfirst);
        }

        #[test]
        fn taskpaper_mode_forces_dash_bullets() {
            let settings = Settings {
                taskpaper_compatible: true,
                translate_tabs_to_spaces: true,
                done_tag: false,
                ..Settings::default()
            };
            let bullets = settings.bullets();
            assert_eq!((bullets.open, bullets.done, bullets.cancelled), ("-", "-", "-"));
            assert_eq!(settings.before_date_space(), "");
            assert_eq!(settings.before_tasks_bullet_spaces(), "\t");
            assert!(settings.writes_tag_name());
        }

        #[test]
        fn rejects_bad_values() {
            assert!(matches!(
                Settings::from_toml_str("date_format = \"%Q\""),
                Err(ConfigError::DateFormat(_))
            ));
            assert!(matches!(
                Settings::from_toml_str("done_tasks_bullet = \" \""),
                Err(ConfigError::EmptyBullet("done_tasks_bullet"))
            ));
            assert!(matches!(
                Settings::from_toml_str("[locale]\nmonths = [\"Jan\"]"),
                Err(ConfigError::Locale)
            ));
            assert!(matches!(
                Settings::from_toml_str("decimal_minutes = 3"),
                Err(ConfigError::Parse(_))
            ));
        }

        #[test]
        fn loads_from_file() {
            let mut file = tempfile::NamedTempFile::new().expect("temp file");
            writeln!(file, "archive_name = \"Done:\"\nhighlight_due_soon = 2").expect("write");
            let settings = Settings::load(file.path()).expect("load settings");
            assert_eq!(settings.archive_name, "Done:");
            assert_eq!(settings.due_soon_threshold(), Duration::hours(2));
        }
    }
}

pub mod grammar {
    //! Line grammar: indentation, bullet, body, inline tags and the terminal
    //! `@done`/`@cancelled` tag with its parenthesized stamp.

    use crate::config::Settings;
    use crate::dates::parse_stamp;
    use crate::model::{Classifier, LineKind};
    use indexmap::IndexMap;
    use nom::{
        IResult,
        bytes::complete::take_while1,
        character::complete::char,
        combinator::opt,
        error::{VerboseError, VerboseErrorKind},
        sequence::{pair, preceded},
    };
    use serde::Serialize;
    use std::ops::Range;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub const HARD_BREAK: &str = "  ";
    pub const DONE: &str = "done";
    pub const CANCELLED: &str = "cancelled";

    /* ------------------------------- Bullets ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum BulletKind {
        Open,
        Done,
        Cancelled,
    }

    const OPEN_GLYPHS: &[&str] = &[
        "[ ]", "☐", "❍", "❑", "■", "□", "▪", "▫", "–", "—", "≡", "→", "›", "-",
    ];
    const DONE_GLYPHS: &[&str] = &["[x]", "[X]", "✔", "✓", "☑", "+"];
    const CANCELLED_GLYPHS: &[&str] = &["[-]", "✘", "x"];

    fn bullet_candidates(settings: &Settings) -> Vec<(&str, BulletKind)> {
        let configured = settings.bullets();
        let mut out = vec![
            (configured.open, BulletKind::Open),
            (configured.done, BulletKind::Done),
            (configured.cancelled, BulletKind::Cancelled),
        ];
        if !settings.taskpaper_compatible {
            out.extend(OPEN_GLYPHS.iter().map(|g| (*g, BulletKind::Open)));
            out.extend(DONE_GLYPHS.iter().map(|g| (*g, BulletKind::Done)));
            out.extend(CANCELLED_GLYPHS.iter().map(|g| (*g, BulletKind::Cancelled)));
        }
        // Stable: configured glyphs win over alternates of the same length.
        out.sort_by_key(|(glyph, _)| std::cmp::Reverse(glyph.len()));
        out
    }

    fn bullet<'a>(i: &'a str, settings: &Settings) -> PResult<'a, (&'a str, BulletKind)> {
        for (glyph, kind) in bullet_candidates(settings) {
            if let Some(rest) = i.strip_prefix(glyph) {
                if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                    return Ok((rest, (&i[..glyph.len()], kind)));
                }
            }
        }
        Err(nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context("bullet"))],
        }))
    }

    /* ------------------------------ Task line ------------------------------ */

    /// Borrowed view of one outline line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskLine<'a> {
        pub indent: &'a str,
        pub bullet: Option<(&'a str, BulletKind)>,
        /// Whitespace between bullet and content.
        pub gap: &'a str,
        /// Everything after the gap, trailing whitespace removed.
        pub content: &'a str,
        /// Content up to the first terminal tag.
        pub body: &'a str,
        pub terminal: Option<Terminal<'a>>,
        pub hard_break: bool,
    }

    /// `@done`/`@cancelled` with the `(...)` group after it (empty when absent) and
    /// whatever follows the group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Terminal<'a> {
        pub name: &'a str,
        pub stamp: &'a str,
        pub rest: &'a str,
    }

    impl<'a> TaskLine<'a> {
        pub fn parse(line: &'a str, settings: &Settings) -> Self {
            let hard_break = line.ends_with(HARD_BREAK) && !line.trim().is_empty();
            let text = line.trim_end();
            let (indent, after_indent) = split_indent(text);
            let (bullet, gap, content) = match bullet(after_indent, settings) {
                Ok((rest, found)) => {
                    let content = rest.trim_start();
                    let gap = &rest[..rest.len() - content.len()];
                    (Some(found), gap, content)
                }
                Err(_) => (None, "", after_indent),
            };
            let (body, terminal) = match find_terminal(content) {
                Some((start, terminal)) => (content[..start].trim_end(), Some(terminal)),
                None => (content, None),
            };
            Self {
                indent,
                bullet,
                gap,
                content,
                body,
                terminal,
                hard_break,
            }
        }

        pub fn bullet_kind(&self) -> Option<BulletKind> {
            self.bullet.map(|(_, kind)| kind)
        }

        /// Width in chars of indentation, bullet and gap.
        pub fn prefix_width(&self) -> usize {
            let bullet = self.bullet.map_or(0, |(glyph, _)| glyph.chars().count());
            self.indent.chars().count() + bullet + self.gap.chars().count()
        }

        pub fn hard_break_suffix(&self) -> &'static str {
            if self.hard_break { HARD_BREAK } else { "" }
        }

        /// Body without trailing tags. A finished line written without the tag name
        /// (`done_tag = false`) also loses its trailing stamp.
        pub fn title(&self, settings: &Settings) -> &'a str {
            let head = strip_trailing_tags(self.body);
            let finished = self
                .bullet_kind()
                .is_some_and(|kind| kind != BulletKind::Open);
            if self.terminal.is_none() && finished {
                if let Some(start) = untagged_stamp_start(head, settings) {
                    return strip_trailing_tags(&head[..start]);
                }
            }
            head
        }
    }

    /// Start of a stamp that ends `text` without a tag name in front of it. The
    /// candidate must follow whitespace and read back with the configured format.
    pub fn untagged_stamp_start(text: &str, settings: &Settings) -> Option<usize> {
        let text = text.trim_end();
        text.char_indices()
            .filter(|&(_, c)| c.is_whitespace())
            .map(|(idx, c)| idx + c.len_utf8())
            .find(|&start| {
                start < text.len()
                    && parse_stamp(&text[start..], &settings.date_format, &settings.locale).is_ok()
            })
    }

    fn find_terminal(content: &str) -> Option<(usize, Terminal<'_>)> {
        let tag = scan_tags(content)
            .into_iter()
            .find(|t| t.name == DONE || t.name == CANCELLED)?;
        let name_end = tag.span.start + 1 + tag.name.len();
        let after = &content[name_end..];
        let terminal = match paren_group(after.trim_start()) {
            Ok((rest, stamp)) => Terminal {
                name: tag.name,
                stamp,
                rest: rest.trim(),
            },
            Err(_) => {
                tracing::debug!(line = content, "terminal tag without a date group");
                Terminal {
                    name: tag.name,
                    stamp: "",
                    rest: after.trim(),
                }
            }
        };
        Some((tag.span.start, terminal))
    }

    /// Split leading spaces/tabs from the rest.
    pub fn split_indent(text: &str) -> (&str, &str) {
        let rest = text.trim_start_matches([' ', '\t']);
        (&text[..text.len() - rest.len()], rest)
    }

    pub fn indent_width(text: &str) -> usize {
        split_indent(text).0.chars().count()
    }

    /// Line text without trailing whitespace, plus whether it ended in a hard break.
    pub fn split_hard_break(line: &str) -> (&str, bool) {
        let hard = line.ends_with(HARD_BREAK) && !line.trim().is_empty();
        (line.trim_end(), hard)
    }

    /* --------------------------------- Tags --------------------------------- */

    /// `@name` or `@name(value)`; `span` covers the `@` through the closing paren.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Tag<'a> {
        pub name: &'a str,
        /// The `(...)` group including its parentheses.
        pub group: Option<&'a str>,
        pub span: Range<usize>,
    }

    impl<'a> Tag<'a> {
        pub fn value(&self) -> Option<&'a str> {
            self.group.map(|g| &g[1..g.len() - 1])
        }
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_' || c == '-'
    }

    fn tag_token(i: &str) -> PResult<'_, (&str, Option<&str>)> {
        pair(preceded(char('@'), take_while1(is_tag_char)), opt(paren_group))(i)
    }

    /// Balanced `( ... )` on one line, parentheses included.
    pub fn paren_group(i: &str) -> PResult<'_, &str> {
        let (_, _) = char::<_, VerboseError<&str>>('(')(i)?;
        let mut depth = 0usize;
        for (idx, c) in i.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok((&i[idx + 1..], &i[..idx + 1]));
                    }
                }
                '\n' => break,
                _ => {}
            }
        }
        Err(nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context("unbalanced parentheses"))],
        }))
    }

    /// Every tag in `text`. A tag must start the text or follow whitespace, so
    /// `mail@example.com` is plain body text.
    pub fn scan_tags(text: &str) -> Vec<Tag<'_>> {
        let mut tags = Vec::new();
        let mut prev: Option<char> = None;
        let mut idx = 0;
        while let Some(c) = text[idx..].chars().next() {
            if c == '@' && prev.is_none_or(char::is_whitespace) {
                if let Ok((after, (name, group))) = tag_token(&text[idx..]) {
                    let end = text.len() - after.len();
                    tags.push(Tag {
                        name,
                        group,
                        span: idx..end,
                    });
                    prev = text[..end].chars().next_back();
                    idx = end;
                    continue;
                }
            }
            prev = Some(c);
            idx += c.len_utf8();
        }
        tags
    }

    /// Tags of one line grouped by name, in first-seen order.
    #[derive(Debug, Clone, Default)]
    pub struct Tags<'a> {
        by_name: IndexMap<&'a str, Vec<Tag<'a>>>,
    }

    impl<'a> Tags<'a> {
        pub fn scan(text: &'a str) -> Self {
            let mut by_name: IndexMap<&'a str, Vec<Tag<'a>>> = IndexMap::new();
            for tag in scan_tags(text) {
                by_name.entry(tag.name).or_default().push(tag);
            }
            Self { by_name }
        }

        pub fn first(&self, name: &str) -> Option<&Tag<'a>> {
            self.by_name.get(name).and_then(|tags| tags.first())
        }

        pub fn all(&self, name: &str) -> &[Tag<'a>] {
            self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
        }

        pub fn contains(&self, name: &str) -> bool {
            self.by_name.contains_key(name)
        }

        pub fn names(&self) -> impl Iterator<Item = &'a str> + '_ {
            self.by_name.keys().copied()
        }
    }

    /// `text` without the tags that end it.
    pub fn strip_trailing_tags(text: &str) -> &str {
        let mut end = text.trim_end().len();
        for tag in scan_tags(text).iter().rev() {
            if text[tag.span.end..end].trim().is_empty() {
                end = tag.span.start;
            } else {
                break;
            }
        }
        text[..end].trim_end()
    }

    /// `text` with every tag named in `names` removed along with the whitespace
    /// before it.
    pub fn remove_tags(text: &str, names: &[&str]) -> String {
        let mut out = String::with_capacity(text.len());
        let mut kept_until = 0;
        for tag in scan_tags(text) {
            if !names.contains(&tag.name) {
                continue;
            }
            let before = &text[kept_until..tag.span.start];
            out.push_str(before.trim_end_matches([' ', '\t']));
            kept_until = tag.span.end;
        }
        out.push_str(&text[kept_until..]);
        out
    }

    /* ------------------------------ Classifier ------------------------------ */

    /// `---` + 3..5 chars + `---...`, or a run of fullwidth low lines.
    pub fn is_separator(trimmed: &str) -> bool {
        if trimmed.chars().count() >= 3 && trimmed.chars().all(|c| c == '＿') {
            return true;
        }
        let Some(inner) = trimmed.strip_prefix("---") else {
            return false;
        };
        let n = inner.chars().count();
        let tail = inner.chars().rev().take_while(|c| *c == '-').count();
        (3..=5).any(|mid| n >= mid + 3 && tail >= n - mid)
    }

    /// A closed header keeps its `@total`; a finished task ending in `:` has none.
    fn closed_header(line: &TaskLine<'_>) -> bool {
        Tags::scan(line.content).contains("total")
    }

    /// Text-pattern classifier used when no editor scope information is available.
    #[derive(Debug, Clone, Copy)]
    pub struct OutlineClassifier<'s> {
        settings: &'s Settings,
    }

    impl<'s> OutlineClassifier<'s> {
        pub fn new(settings: &'s Settings) -> Self {
            Self { settings }
        }
    }

    impl Classifier for OutlineClassifier<'_> {
        fn classify_line(&self, text: &str) -> LineKind {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return LineKind::Empty;
            }
            if is_separator(trimmed) {
                return LineKind::Separator;
            }
            let line = TaskLine::parse(text, self.settings);
            let titled = line.title(self.settings).ends_with(':');
            match line.bullet_kind() {
                None if titled => LineKind::Header,
                None => LineKind::Note,
                Some(_) if self.settings.taskpaper_compatible => {
                    match line.terminal.map(|t| t.name) {
                        Some(_) if titled && closed_header(&line) => LineKind::Header,
                        Some(DONE) => LineKind::Completed,
                        Some(CANCELLED) => LineKind::Cancelled,
                        _ => LineKind::Pending,
                    }
                }
                Some(BulletKind::Open) => LineKind::Pending,
                Some(_) if titled && closed_header(&line) => LineKind::Header,
                Some(BulletKind::Done) => LineKind::Completed,
                Some(BulletKind::Cancelled) => LineKind::Cancelled,
            }
        }
    }

}

pub mod dates {
    //! Short date expressions resolved against a reference time.
    //!
    //! Absolute forms (`23`, `1-1`, `16.12.1`, `3 10:`) always pick the nearest future
    //! occurrence. Relative forms (`+`, `+3d`, `+2w 10:00`, `++`) count from the
    //! reference time, or from the line's `@created(...)` for `++`.

    use crate::model::{DateError, DateParts, Locale, Notice};
    use crate::grammar::Tags;
    use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
    use nom::{
        IResult,
        character::complete::{char, digit0, digit1, multispace0, one_of},
        combinator::{not, opt},
        error::VerboseError,
        sequence::{terminated, tuple},
    };
    use std::fmt::Write;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Calendar limit shared with the stamps this format has always produced.
    const MAX_YEAR: i64 = 9999;

    /* --------------------------- Format ordering --------------------------- */

    /// Field order hints for ambiguous numeric dates, read off the date format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DateOrder {
        pub yearfirst: bool,
        pub dayfirst: bool,
    }

    impl DateOrder {
        pub fn from_format(format: &str) -> Self {
            Self {
                yearfirst: is_yearfirst(format),
                dayfirst: is_dayfirst(format),
            }
        }
    }

    fn bare_format(format: &str) -> &str {
        format.trim_matches(|c| c == '(' || c == ')' || c == ' ')
    }

    pub fn is_yearfirst(format: &str) -> bool {
        let bare = bare_format(format);
        bare.starts_with("%y") || bare.starts_with("%Y")
    }

    pub fn is_dayfirst(format: &str) -> bool {
        bare_format(format).starts_with("%d")
    }

    /* ------------------------ Formatting / strict parse ------------------------ */

    pub fn format_timestamp(at: NaiveDateTime, format: &str, locale: &Locale) -> String {
        let format = locale.localize_format(
            format,
            at.month0() as usize,
            at.weekday().num_days_from_monday() as usize,
        );
        let mut out = String::new();
        if write!(out, "{}", at.format(&format)).is_err() {
            tracing::warn!(format = %format, "date format could not be rendered");
            out.clear();
        }
        out
    }

    fn strict(text: &str, format: &str) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(text, format).ok().or_else(|| {
            NaiveDate::parse_from_str(text, format)
                .ok()
                .map(|date| date.and_time(NaiveTime::MIN))
        })
    }

    fn delocalize(text: &str, locale: &Locale, english: &Locale) -> String {
        let mut out = text.to_string();
        for (ours, theirs) in [
            (&locale.months, &english.months),
            (&locale.months_short, &english.months_short),
            (&locale.weekdays, &english.weekdays),
            (&locale.weekdays_short, &english.weekdays_short),
        ] {
            for (from, to) in ours.iter().zip(theirs.iter()) {
                if !from.is_empty() {
                    out = out.replace(from.as_str(), to);
                }
            }
        }
        out
    }

    /// Parse `text` exactly as `format` writes it. Date-only formats give midnight.
    pub fn parse_formatted(text: &str, format: &str, locale: &Locale) -> Option<NaiveDateTime> {
        strict(text, format)
            .or_else(|| strict(text.trim(), format))
            .or_else(|| {
                let english = Locale::default();
                (*locale != english)
                    .then(|| delocalize(text.trim(), locale, &english))
                    .and_then(|text| strict(&text, format))
            })
    }

    /// Read a tag's `(...)` group back with the configured format.
    pub fn parse_stamp(
        group: &str,
        format: &str,
        locale: &Locale,
    ) -> Result<NaiveDateTime, DateError> {
        let inner = group.strip_prefix('(').and_then(|g| g.strip_suffix(')'));
        parse_formatted(group, format, locale)
            .or_else(|| inner.and_then(|inner| parse_formatted(inner, format, locale)))
            .ok_or_else(|| DateError::FormatMismatch {
                text: group.to_string(),
                format: format.to_string(),
            })
    }

    /* ------------------------- Absolute short form ------------------------- */

    impl From<NaiveDateTime> for DateParts {
        fn from(at: NaiveDateTime) -> Self {
            Self {
                year: Some(i64::from(at.year())),
                month: Some(i64::from(at.month())),
                day: Some(i64::from(at.day())),
                hour: Some(i64::from(at.hour())),
                minute: Some(i64::from(at.minute())),
            }
        }
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct ShortDate<'a> {
        first: &'a str,
        second: &'a str,
        third: &'a str,
        hour: &'a str,
        minute: &'a str,
    }

    fn digits(i: &str) -> (&str, &str) {
        let end = i.find(|c: char| !c.is_ascii_digit()).unwrap_or(i.len());
        (&i[..end], &i[end..])
    }

    /// Up to three digit groups joined by one repeated `-` or `.`, then `H:M`.
    /// A digit run directly followed by `:` is an hour and ends the date part.
    fn split_short_date(text: &str) -> ShortDate<'_> {
        let start = text.trim_start();
        let mut out = ShortDate::default();
        let mut rest = start;
        let (first, after_first) = digits(start);
        if !after_first.starts_with(':') {
            out.first = first;
            rest = after_first;
            let sep = after_first.chars().next().filter(|c| matches!(c, '-' | '.'));
            if let Some(sep) = sep {
                let (second, after_second) = digits(&after_first[1..]);
                if !after_second.starts_with(':') {
                    out.second = second;
                    rest = after_second;
                    if let Some(after_sep) = after_second.strip_prefix(sep) {
                        let (third, after_third) = digits(after_sep);
                        if !after_third.starts_with(':') {
                            out.third = third;
                            rest = after_third;
                        }
                    }
                }
            }
        }
        let clock = rest.trim_start();
        let (hour, after_hour) = digits(clock);
        if let Some(after_colon) = after_hour.strip_prefix(':') {
            out.hour = hour;
            out.minute = digits(after_colon).0;
        }
        out
    }

    fn number(text: &str) -> Option<i64> {
        text.parse().ok()
    }

    fn resolve_short_date(d: &ShortDate<'_>, now: NaiveDateTime) -> Option<DateParts> {
        let or_zero = |t: &str| if t.is_empty() { Some(0) } else { number(t) };
        let mut year = i64::from(now.year());
        let mut month = i64::from(now.month());
        let mut day = or_zero(d.third)?;
        if day != 0 {
            year = number(d.first)?;
            month = number(d.second)?;
        } else {
            day = or_zero(d.second)?;
            if day != 0 {
                month = number(d.first)?;
                if month < i64::from(now.month()) {
                    year += 1;
                }
            } else {
                day = or_zero(d.first)?;
                if 0 < day && day <= i64::from(now.day()) {
                    month += 1;
                    if month == 13 {
                        year += 1;
                        month = 1;
                    }
                } else if day == 0 {
                    day = i64::from(now.day());
                }
            }
        }
        let hour = if d.hour.is_empty() {
            i64::from(now.hour())
        } else {
            number(d.hour)?
        };
        let minute = if d.minute.is_empty() {
            i64::from(now.minute())
        } else {
            number(d.minute)?
        };
        if year < 100 {
            year += 2000;
        }
        Some(DateParts {
            year: Some(year),
            month: Some(month),
            day: Some(day),
            hour: Some(hour),
            minute: Some(minute),
        })
    }

    /// Build a timestamp without clamping anything.
    pub fn build_datetime(parts: DateParts) -> Result<NaiveDateTime, DateError> {
        let fail = |reason: &str| DateError::Construction {
            parts,
            reason: reason.to_string(),
        };
        let (Some(year), Some(month), Some(day), Some(hour), Some(minute)) =
            (parts.year, parts.month, parts.day, parts.hour, parts.minute)
        else {
            return Err(fail("incomplete date"));
        };
        if !(1..=MAX_YEAR).contains(&year) {
            return Err(fail("year is out of range"));
        }
        if !(1..=12).contains(&month) {
            return Err(fail("month must be in 1..12"));
        }
        let date = u32::try_from(day)
            .ok()
            .and_then(|day| NaiveDate::from_ymd_opt(year as i32, month as u32, day))
            .ok_or_else(|| fail("day is out of range for month"))?;
        if !(0..24).contains(&hour) {
            return Err(fail("hour must be in 0..23"));
        }
        if !(0..60).contains(&minute) {
            return Err(fail("minute must be in 0..59"));
        }
        NaiveTime::from_hms_opt(hour as u32, minute as u32, 0)
            .map(|time| date.and_time(time))
            .ok_or_else(|| fail("invalid time"))
    }

    /// Resolve an absolute short date against `now`.
    pub fn convert_date(text: &str, now: NaiveDateTime) -> Result<NaiveDateTime, DateError> {
        let parts = resolve_short_date(&split_short_date(text), now).ok_or_else(|| {
            DateError::Construction {
                parts: DateParts::default(),
                reason: format!("cannot read {:?} as a short date", text.trim()),
            }
        })?;
        build_datetime(parts)
    }

    /* ----------------------------- Natural parse ----------------------------- */

    fn parse_clock(word: &str) -> Option<(u32, u32, u32)> {
        let mut fields = word.split(':');
        let hour = fields.next()?.parse().ok()?;
        let minute = fields.next()?.parse().ok()?;
        let second = match fields.next() {
            Some(s) => s.parse().ok()?,
            None => 0,
        };
        if fields.next().is_some() {
            return None;
        }
        Some((hour, minute, second))
    }

    fn year_like(token: &str) -> bool {
        token.len() >= 3 || token.parse::<u32>().map_or(true, |v| v > 31)
    }

    fn year_value(token: &str) -> Option<i64> {
        let value = number(token)?;
        Some(if token.len() <= 2 { value + 2000 } else { value })
    }

    /// Digit groups, month names and a clock in free order.
    fn parse_natural(
        bare: &str,
        order: DateOrder,
        default: NaiveDateTime,
        locale: &Locale,
    ) -> Option<NaiveDateTime> {
        let mut numbers: Vec<&str> = Vec::new();
        let mut month_name = None;
        let mut clock = None;
        for word in bare.split_whitespace() {
            let word = word.trim_matches(',');
            if word.contains(':') {
                if clock.replace(parse_clock(word)?).is_some() {
                    return None;
                }
                continue;
            }
            for token in word.split(['-', '.', '/', ',']).filter(|t| !t.is_empty()) {
                if token.chars().all(|c| c.is_ascii_digit()) {
                    numbers.push(token);
                } else if let Some(month) = locale.month_from_name(token) {
                    if month_name.replace(month).is_some() {
                        return None;
                    }
                } else if !locale.is_weekday(token) {
                    return None;
                }
            }
        }

        let mut year = None;
        let mut month = month_name.map(i64::from);
        let mut day = None;
        match (month_name, numbers.as_slice()) {
            (None, [single]) => match single.len() {
                3 | 4 => year = Some(number(single)?),
                6 => {
                    year = Some(year_value(&single[..2])?);
                    month = Some(number(&single[2..4])?);
                    day = Some(number(&single[4..])?);
                }
                8 => {
                    year = Some(number(&single[..4])?);
                    month = Some(number(&single[4..6])?);
                    day = Some(number(&single[6..])?);
                }
                _ => return None,
            },
            (None, [a, b, c]) => {
                let (y, m, d) = if year_like(a) {
                    (a, b, c)
                } else if year_like(c) && order.dayfirst {
                    (c, b, a)
                } else if year_like(c) {
                    (c, a, b)
                } else if order.yearfirst {
                    (a, b, c)
                } else if order.dayfirst {
                    (c, b, a)
                } else {
                    (c, a, b)
                };
                year = Some(year_value(y)?);
                month = Some(number(m)?);
                day = Some(number(d)?);
            }
            (Some(_), []) => {}
            (Some(_), [single]) if year_like(single) => year = Some(year_value(single)?),
            (Some(_), [single]) => day = Some(number(single)?),
            (Some(_), [a, b]) => {
                let (y, d) = if year_like(a) {
                    (a, b)
                } else if year_like(b) || !order.yearfirst {
                    (b, a)
                } else {
                    (a, b)
                };
                year = Some(year_value(y)?);
                day = Some(number(d)?);
            }
            _ => return None,
        }

        let year = year.unwrap_or(i64::from(default.year()));
        if year < 1 {
            return None;
        }
        let month = month.unwrap_or(i64::from(default.month()));
        let day = day.unwrap_or(i64::from(default.day()));
        let (hour, minute, second) = clock.unwrap_or((default.hour(), default.minute(), 0));
        NaiveDate::from_ymd_opt(
            i32::try_from(year).ok()?,
            u32::try_from(month).ok()?,
            u32::try_from(day).ok()?,
        )?
        .and_hms_opt(hour, minute, second)
    }

    /// Strict parse with `format`, then the short-date rules, then a natural parse.
    pub fn parse_date(
        text: &str,
        format: &str,
        order: DateOrder,
        default: NaiveDateTime,
        locale: &Locale,
    ) -> Result<NaiveDateTime, DateError> {
        if let Some(at) = parse_formatted(text, format, locale) {
            return Ok(at);
        }
        let bare = text.trim_matches(|c| c == '(' || c == ')' || c == ' ');
        let separator = if bare.contains('-') { '-' } else { '.' };
        let items = bare.split(separator).count();
        let short = (items < 2 && bare.chars().count() < 3)
            || (items < 3 && (text.contains('-') || text.contains('.')));
        if !short {
            if let Some(at) = parse_natural(bare, order, default, locale) {
                if at.year() < 1900 && format.contains("%y") {
                    return Err(DateError::Construction {
                        parts: DateParts::from(at),
                        reason: "a two-digit year format cannot hold years before 1900".into(),
                    });
                }
                return Ok(at);
            }
            tracing::debug!(text = bare, "no natural reading, trying the short form");
        }
        convert_date(bare, default)
    }

    /* ------------------------------ Relative form ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct Increment {
        count: Option<i64>,
        days: bool,
        weeks: bool,
        hour: i64,
        minute: i64,
    }

    fn amount(digits: &str) -> i64 {
        if digits.is_empty() {
            0
        } else {
            digits.parse().unwrap_or(i64::MAX)
        }
    }

    /// `+`/`++`, optional count, optional `d`/`w`, optional `H:M` or `H.M`.
    fn increment(i: &str) -> PResult<'_, Increment> {
        let (i, _) = multispace0(i)?;
        let (i, _) = char('+')(i)?;
        let (i, _) = opt(char('+'))(i)?;
        let (i, _) = multispace0(i)?;
        let (i, count) = opt(terminated(digit1, not(one_of(":."))))(i)?;
        let (i, _) = multispace0(i)?;
        let (i, days) = opt(one_of("dD"))(i)?;
        let (i, weeks) = opt(one_of("wW"))(i)?;
        let (i, clock) = opt(tuple((multispace0, digit0, one_of(":."), digit0)))(i)?;
        let (hour, minute) = clock.map_or((0, 0), |(_, h, _, m)| (amount(h), amount(m)));
        Ok((
            i,
            Increment {
                count: count.map(amount),
                days: days.is_some(),
                weeks: weeks.is_some(),
                hour,
                minute,
            },
        ))
    }

    impl Increment {
        fn apply(&self, base: NaiveDateTime) -> Result<NaiveDateTime, DateError> {
            let unit = self.days || self.weeks;
            let count = match self.count {
                Some(count) => count,
                None if unit || (self.hour == 0 && self.minute == 0) => 1,
                None => 0,
            };
            let amount = if self.weeks {
                count.saturating_mul(7)
            } else {
                count
            };
            let overflow = || DateError::Overflow {
                amount,
                hour: self.hour,
                minute: self.minute,
            };
            let delta = Duration::try_days(amount)
                .zip(Duration::try_hours(self.hour))
                .zip(Duration::try_minutes(self.minute))
                .and_then(|((d, h), m)| d.checked_add(&h)?.checked_add(&m))
                .ok_or_else(overflow)?;
            base.checked_add_signed(delta)
                .filter(|at| i64::from(at.year()) <= MAX_YEAR)
                .ok_or_else(overflow)
        }
    }

    /// A resolved expression plus any warning raised on the way.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Expansion {
        pub date: NaiveDateTime,
        pub notice: Option<Notice>,
    }

    fn created_reference(
        line: &str,
        format: &str,
        now: NaiveDateTime,
        locale: &Locale,
    ) -> Result<NaiveDateTime, String> {
        let tags = Tags::scan(line);
        let value = tags
            .first("created")
            .and_then(|tag| tag.value())
            .ok_or_else(|| "no @created(...) on this line".to_string())?;
        parse_date(value, format, DateOrder::from_format(format), now, locale)
            .map_err(|err| err.to_string())
    }

    /// Resolve a relative expression. `line` is the full text of the line the
    /// expression sits on; `++` reads its `@created(...)`.
    pub fn increase_date(
        text: &str,
        now: NaiveDateTime,
        line: &str,
        format: &str,
        locale: &Locale,
    ) -> Result<Expansion, DateError> {
        let mut base = now;
        let mut notice = None;
        if text.contains("++") {
            match created_reference(line, format, now, locale) {
                Ok(created) => base = created,
                Err(reason) => {
                    tracing::warn!(%reason, "`++` has no usable @created date, counting from now");
                    notice = Some(Notice::MissingCreatedReference { reason });
                }
            }
        }
        let start = text.find('+').unwrap_or(0);
        let inc = match increment(&text[start..]) {
            Ok((_, inc)) => inc,
            Err(_) => Increment::default(),
        };
        Ok(Expansion {
            date: inc.apply(base)?,
            notice,
        })
    }

    /// Relative when the text holds a `+`, absolute otherwise.
    pub fn expand_short_date(
        text: &str,
        now: NaiveDateTime,
        line: &str,
        format: &str,
        locale: &Locale,
    ) -> Result<Expansion, DateError> {
        if text.contains('+') {
            increase_date(text, now, line, format, locale)
        } else {
            parse_date(text, format, DateOrder::from_format(format), now, locale)
                .map(|date| Expansion { date, notice: None })
        }
    }

}

pub mod duration {
    use chrono::Duration;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::tag,
        character::complete::{char, digit1, space0},
        combinator::{all_consuming, map, opt},
        error::VerboseError,
        sequence::{delimited, preceded, terminated, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    const DAY: i64 = 86_400;

    /// `D day(s), H:MM:SS` the way time spans have always been written in this format.
    fn clock_text(days: i64, rem: i64) -> String {
        let clock = format!("{}:{:02}:{:02}", rem / 3600, rem % 3600 / 60, rem % 60);
        if days == 0 {
            clock
        } else {
            let plural = if days.abs() != 1 { "s" } else { "" };
            format!("{days} day{plural}, {clock}")
        }
    }

    /// Render an elapsed span. Sub-seconds are dropped, then zero seconds, then a
    /// whole zero clock. An empty result means "nothing measurable".
    pub fn format_delta(delta: Duration, decimal: bool) -> String {
        let secs = delta.num_seconds();
        let days = secs.div_euclid(DAY);
        let rem = secs.rem_euclid(DAY);
        let mut text = if decimal {
            let head = if days != 0 {
                format!("{days} day{}, ", if days > 1 { "s" } else { "" })
            } else {
                String::new()
            };
            let hours = format!("{:.2}", rem as f64 / 3600.0);
            if hours == "0.00" { head } else { head + &hours }
        } else {
            clock_text(days, rem)
        };
        if text.ends_with(" 0:00:00") || text == "0:00:00" {
            text.truncate(text.len() - 7);
        } else if text.ends_with(":00") {
            text.truncate(text.len() - 3);
        }
        text.trim_matches(|c| c == ' ' || c == ',').to_string()
    }

    /// Phrase used when a span renders empty.
    pub fn zero_fallback(date_format: &str) -> &'static str {
        if date_format.contains("%H") {
            "a bit"
        } else {
            "less than a day"
        }
    }

    pub fn format_delta_or_fallback(delta: Duration, decimal: bool, date_format: &str) -> String {
        let text = format_delta(delta, decimal);
        if text.is_empty() {
            zero_fallback(date_format).to_string()
        } else {
            text
        }
    }

    /* ------------------------------ Reading back ------------------------------ */

    fn num(i: &str) -> PResult<'_, i64> {
        map(digit1, |d: &str| d.parse().unwrap_or(i64::MAX))(i)
    }

    fn days_part(i: &str) -> PResult<'_, i64> {
        terminated(
            num,
            tuple((space0, tag("day"), opt(char('s')), opt(char(',')))),
        )(i)
    }

    fn clock_part(i: &str) -> PResult<'_, i64> {
        map(
            tuple((num, char(':'), num, opt(preceded(char(':'), num)))),
            |(h, _, m, s)| {
                h.saturating_mul(3600)
                    .saturating_add(m.saturating_mul(60))
                    .saturating_add(s.unwrap_or(0))
            },
        )(i)
    }

    fn decimal_part(i: &str) -> PResult<'_, i64> {
        map(tuple((num, char('.'), digit1)), |(h, _, frac): (i64, char, &str)| {
            let frac: f64 = format!("0.{frac}").parse().unwrap_or(0.0);
            h.saturating_mul(3600).saturating_add((frac * 3600.0).round() as i64)
        })(i)
    }

    fn span(i: &str) -> PResult<'_, i64> {
        map(
            delimited(
                space0,
                tuple((opt(days_part), space0, opt(alt((clock_part, decimal_part))))),
                space0,
            ),
            |(days, _, secs)| {
                days.unwrap_or(0)
                    .saturating_mul(DAY)
                    .saturating_add(secs.unwrap_or(0))
            },
        )(i)
    }

    /// Read a `@lasted/@wasted/@total` value (`3 days, 22:00`, `1:00:05`, `1.13`).
    /// Fallback phrases and anything else unreadable give `None`.
    pub fn parse_duration(value: &str) -> Option<Duration> {
        if value.trim().is_empty() {
            return None;
        }
        let (_, secs) = all_consuming(span)(value).ok()?;
        Duration::try_seconds(secs)
    }

}

pub mod intervals {
    use crate::model::{DateError, Locale};
    use crate::dates::parse_stamp;
    use crate::grammar::Tags;
    use chrono::{Duration, NaiveDateTime};

    /// Sum of `(p[1] - p[0])` over `[start] + toggles + [end]` taken in pairs.
    /// An unpaired last point adds nothing.
    pub fn accumulate(
        start: NaiveDateTime,
        toggles: &[NaiveDateTime],
        end: NaiveDateTime,
    ) -> Duration {
        let mut points = Vec::with_capacity(toggles.len() + 2);
        points.push(start);
        points.extend_from_slice(toggles);
        points.push(end);
        points
            .chunks_exact(2)
            .fold(Duration::zero(), |total, pair| total + (pair[1] - pair[0]))
    }

    /// `@started(...)` and `@toggle(...)` stamps of one line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TimeTracking {
        pub start: NaiveDateTime,
        pub toggles: Vec<NaiveDateTime>,
    }

    impl TimeTracking {
        /// `Ok(None)` when the line was never started.
        pub fn from_line(
            line: &str,
            date_format: &str,
            locale: &Locale,
        ) -> Result<Option<Self>, DateError> {
            let tags = Tags::scan(line);
            let Some(started) = tags.first("started") else {
                return Ok(None);
            };
            let stamp = |group: Option<&str>| parse_stamp(group.unwrap_or(""), date_format, locale);
            let start = stamp(started.group)?;
            let toggles = tags
                .all("toggle")
                .iter()
                .map(|toggle| stamp(toggle.group))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(Self { start, toggles }))
        }

        pub fn elapsed(&self, end: NaiveDateTime) -> Duration {
            accumulate(self.start, &self.toggles, end)
        }
    }

}

pub mod projects {
    use crate::config::Settings;
    use crate::model::{Classifier, Document, LineKind};
    use crate::grammar::{TaskLine, indent_width, strip_trailing_tags};
    use serde::Serialize;
    use std::fmt;

    /* -------------------------------- Markers -------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "kind", content = "name", rename_all = "snake_case")]
    pub enum MarkerKind {
        Header(String),
        Separator,
    }

    /// A header or separator line and its indentation width.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ProjectMarker {
        pub line: usize,
        pub indent: usize,
        pub kind: MarkerKind,
    }

    /// Header text without bullet, trailing tags or surrounding colons.
    pub fn header_name(text: &str, settings: &Settings) -> String {
        let line = TaskLine::parse(text, settings);
        line.title(settings)
            .trim()
            .trim_matches(':')
            .trim()
            .to_string()
    }

    /// Markers in document order.
    pub fn collect_markers<C: Classifier>(
        doc: &Document,
        classifier: &C,
        settings: &Settings,
    ) -> Vec<ProjectMarker> {
        doc.lines()
            .enumerate()
            .filter_map(|(line, text)| {
                let kind = match classifier.classify_line(text) {
                    LineKind::Header => MarkerKind::Header(header_name(text, settings)),
                    LineKind::Separator => MarkerKind::Separator,
                    _ => return None,
                };
                Some(ProjectMarker {
                    line,
                    indent: indent_width(text),
                    kind,
                })
            })
            .collect()
    }

    /* ------------------------------ Project path ------------------------------ */

    /// Enclosing header names, outermost first.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    #[serde(transparent)]
    pub struct ProjectPath(pub Vec<String>);

    impl ProjectPath {
        pub fn is_empty(&self) -> bool {
            self.0.is_empty()
        }

        /// `@project(A / B)`, or `None` for a task outside every header.
        pub fn tag(&self) -> Option<String> {
            (!self.is_empty()).then(|| format!("@project({self})"))
        }
    }

    impl fmt::Display for ProjectPath {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0.join(" / "))
        }
    }

    /// Walk back from the task with a ceiling that starts at the task's indentation.
    /// A shallower header joins the path and lowers the ceiling; a shallower
    /// separator only lowers it. The walk ends once the ceiling reaches zero.
    pub fn resolve_project_path(
        task_line: usize,
        task_indent: usize,
        markers: &[ProjectMarker],
    ) -> ProjectPath {
        let preceding = markers.partition_point(|m| m.line < task_line);
        let mut ceiling = task_indent;
        let mut names = Vec::new();
        for marker in markers[..preceding].iter().rev() {
            if ceiling == 0 {
                break;
            }
            if marker.indent >= ceiling {
                continue;
            }
            ceiling = marker.indent;
            if let MarkerKind::Header(name) = &marker.kind {
                names.push(name.clone());
            }
        }
        names.reverse();
        ProjectPath(names)
    }

    /// One past the last line nested under `header`: the first non-empty line at
    /// or above the header's indentation ends the block.
    pub fn block_end(doc: &Document, header: usize) -> usize {
        let Some(text) = doc.line(header) else {
            return header;
        };
        let ceiling = indent_width(text);
        let mut end = header + 1;
        for (idx, line) in doc.lines().enumerate().skip(header + 1) {
            if line.trim().is_empty() {
                continue;
            }
            if indent_width(line) <= ceiling {
                break;
            }
            end = idx + 1;
        }
        end
    }

}

pub mod transition {
    //! Task state machine: completing, cancelling and reopening one line.

    use crate::config::Settings;
    use crate::model::{LineKind, Notice};
    use crate::dates::{format_timestamp, parse_formatted, parse_stamp};
    use crate::duration::format_delta_or_fallback;
    use crate::grammar::{
        CANCELLED, DONE, TaskLine, remove_tags, strip_trailing_tags, untagged_stamp_start,
    };
    use crate::intervals::TimeTracking;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Serialize};

    const DERIVED_TAGS: &[&str] = &["lasted", "wasted"];

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Action {
        Complete,
        Cancel,
    }

    impl Action {
        pub fn tag(self) -> &'static str {
            match self {
                Self::Complete => DONE,
                Self::Cancel => CANCELLED,
            }
        }

        pub fn elapsed_tag(self) -> &'static str {
            match self {
                Self::Complete => "lasted",
                Self::Cancel => "wasted",
            }
        }
    }

    /// New text for a line. `column_shift` is how far text after the bullet moved,
    /// in chars, so cursors can follow it.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Rewrite {
        pub text: String,
        pub column_shift: isize,
        pub recompute_total: bool,
        pub notices: Vec<Notice>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Outcome {
        Rewritten(Rewrite),
        Refused(Notice),
        Untouched,
    }

    fn width(text: &str) -> isize {
        text.chars().count() as isize
    }

    /// Applies actions with one fixed reference time.
    #[derive(Debug, Clone, Copy)]
    pub struct Transition<'a> {
        settings: &'a Settings,
        now: NaiveDateTime,
    }

    impl<'a> Transition<'a> {
        pub fn new(settings: &'a Settings, now: NaiveDateTime) -> Self {
            Self { settings, now }
        }

        pub fn apply(&self, line: &str, kind: LineKind, action: Action) -> Outcome {
            match (kind, action) {
                (LineKind::Pending, _) => Outcome::Rewritten(self.close(line, action)),
                (LineKind::Completed, Action::Complete) | (LineKind::Cancelled, Action::Cancel) => {
                    Outcome::Rewritten(self.reopen(line))
                }
                (LineKind::Completed, Action::Cancel) => Outcome::Refused(Notice::CancelCompleted),
                (LineKind::Cancelled, Action::Complete) => {
                    let reopened = self.reopen(line);
                    let mut closed = self.close(&reopened.text, action);
                    closed.column_shift += reopened.column_shift;
                    Outcome::Rewritten(closed)
                }
                (LineKind::Header, _) => self.header(line, action),
                _ => Outcome::Untouched,
            }
        }

        fn header(&self, line: &str, action: Action) -> Outcome {
            let parts = TaskLine::parse(line, self.settings);
            match parts.terminal.map(|t| t.name) {
                None => Outcome::Rewritten(self.close_header(line, action)),
                Some(DONE) if action == Action::Cancel => Outcome::Refused(Notice::CancelCompleted),
                Some(name) if name == action.tag() => Outcome::Rewritten(self.reopen_header(line)),
                Some(_) => {
                    let reopened = self.reopen_header(line);
                    let mut closed = self.close_header(&reopened.text, action);
                    closed.column_shift += reopened.column_shift;
                    Outcome::Rewritten(closed)
                }
            }
        }

        /* ------------------------------ Closing ------------------------------ */

        fn stamp(&self) -> String {
            format_timestamp(self.now, &self.settings.date_format, &self.settings.locale)
        }

        fn closing(&self, action: Action, stamp: &str) -> String {
            let tag = if self.settings.writes_tag_name() {
                format!("@{}", action.tag())
            } else {
                String::new()
            };
            format!(" {tag}{}{stamp}", self.settings.before_date_space())
        }

        /// ` @lasted(...)`/` @wasted(...)` for a started line, measured up to the
        /// stamp as written, so the span has the format's precision.
        fn elapsed(
            &self,
            line: &str,
            action: Action,
            stamp: &str,
            notices: &mut Vec<Notice>,
        ) -> Option<String> {
            let format = &self.settings.date_format;
            let locale = &self.settings.locale;
            match TimeTracking::from_line(line, format, locale) {
                Ok(Some(tracking)) => {
                    let end = parse_formatted(stamp, format, locale).unwrap_or(self.now);
                    let span = format_delta_or_fallback(
                        tracking.elapsed(end),
                        self.settings.decimal_minutes,
                        format,
                    );
                    Some(format!(" @{}({span})", action.elapsed_tag()))
                }
                Ok(None) => None,
                Err(err) => {
                    tracing::warn!(%err, "skipping elapsed time");
                    notices.push(Notice::UnreadableTimestamp {
                        detail: err.to_string(),
                    });
                    None
                }
            }
        }

        fn finish(
            &self,
            line: &str,
            head: String,
            action: Action,
            hard_break: &str,
        ) -> (String, Vec<Notice>) {
            let stamp = self.stamp();
            let mut notices = Vec::new();
            let mut text = head.trim_end().to_string();
            text.push_str(&self.closing(action, &stamp));
            if let Some(elapsed) = self.elapsed(line, action, &stamp, &mut notices) {
                text.push_str(&elapsed);
            }
            text.push_str(hard_break);
            (text, notices)
        }

        fn close(&self, line: &str, action: Action) -> Rewrite {
            self.close_line(line, action, false)
        }

        /// Headers take a bullet too; their `@total` is refreshed afterwards.
        fn close_header(&self, line: &str, action: Action) -> Rewrite {
            self.close_line(line, action, true)
        }

        fn close_line(&self, line: &str, action: Action, recompute_total: bool) -> Rewrite {
            let parts = TaskLine::parse(line, self.settings);
            let bullets = self.settings.bullets();
            let bullet = match action {
                Action::Complete => bullets.done,
                Action::Cancel => bullets.cancelled,
            };
            let gap = if parts.gap.is_empty() && !parts.content.is_empty() {
                " "
            } else {
                parts.gap
            };
            let prefix = format!("{}{bullet}{gap}", parts.indent);
            let column_shift = width(&prefix) - parts.prefix_width() as isize;
            let head = format!("{prefix}{}", parts.content);
            let (text, notices) = self.finish(line, head, action, parts.hard_break_suffix());
            Rewrite {
                text,
                column_shift,
                recompute_total,
                notices,
            }
        }

        /* ------------------------------ Reopening ------------------------------ */

        /// Text after the body that survives reopening: a parenthesized group that is
        /// not a stamp, and whatever followed it minus derived elapsed-time tags.
        fn remainder(&self, parts: &TaskLine<'_>) -> String {
            let Some(terminal) = parts.terminal else {
                return String::new();
            };
            let mut out = String::new();
            let stamp = terminal.stamp;
            if !stamp.is_empty()
                && parse_stamp(stamp, &self.settings.date_format, &self.settings.locale).is_err()
            {
                out.push(' ');
                out.push_str(stamp);
            }
            let rest = remove_tags(terminal.rest, DERIVED_TAGS);
            let rest = rest.trim();
            if !rest.is_empty() {
                out.push(' ');
                out.push_str(rest);
            }
            out
        }

        /// Body and surviving tail of a finished line. Without a terminal tag the
        /// stamp is the trailing group that reads back as a date.
        fn reopened_parts<'l>(&self, parts: &TaskLine<'l>) -> (&'l str, String) {
            if parts.terminal.is_some() {
                return (parts.body, self.remainder(parts));
            }
            let head = strip_trailing_tags(parts.body);
            let Some(start) = untagged_stamp_start(head, self.settings) else {
                tracing::debug!(line = parts.content, "finished line without a stamp");
                return (parts.body, String::new());
            };
            let rest = remove_tags(&parts.body[head.len()..], DERIVED_TAGS);
            let rest = rest.trim();
            let tail = if rest.is_empty() {
                String::new()
            } else {
                format!(" {rest}")
            };
            (head[..start].trim_end(), tail)
        }

        fn reopen(&self, line: &str) -> Rewrite {
            let parts = TaskLine::parse(line, self.settings);
            let open = self.settings.bullets().open;
            let gap = if parts.gap.is_empty() && !parts.body.is_empty() {
                " "
            } else {
                parts.gap
            };
            let prefix = format!("{}{open}{gap}", parts.indent);
            let column_shift = width(&prefix) - parts.prefix_width() as isize;
            let (body, rest) = self.reopened_parts(&parts);
            let text = format!("{prefix}{body}{rest}");
            Rewrite {
                text: format!("{}{}", text.trim_end(), parts.hard_break_suffix()),
                column_shift,
                recompute_total: false,
                notices: Vec::new(),
            }
        }

        fn reopen_header(&self, line: &str) -> Rewrite {
            let parts = TaskLine::parse(line, self.settings);
            let column_shift = width(parts.indent) - parts.prefix_width() as isize;
            let (body, rest) = self.reopened_parts(&parts);
            let text = format!("{}{body}{rest}", parts.indent);
            Rewrite {
                text: format!("{}{}", text.trim_end(), parts.hard_break_suffix()),
                column_shift,
                recompute_total: false,
                notices: Vec::new(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        fn now() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2016, 12, 31)
                .expect("valid date")
                .and_hms_opt(23, 0, 42)
                .expect("valid time")
        }

        fn rewrite(settings: &Settings, line: &str, kind: LineKind, action: Action) -> Rewrite {
            match Transition::new(settings, now()).apply(line, kind, action) {
                Outcome::Rewritten(rewrite) => rewrite,
                other => panic!("expected a rewrite of {line:?}, got {other:?}"),
            }
        }

        #[test]
        fn completes_and_cancels_pending_tasks() {
            let s = Settings::default();
            let done = rewrite(&s, "  ☐ write report @high", LineKind::Pending, Action::Complete);
            assert_eq!(done.text, "  ✔ write report @high @done (16-12-31 23:00)");
            assert_eq!(done.column_shift, 0);
            assert!(!done.recompute_total);

            let cancelled = rewrite(&s, "  ☐ write report", LineKind::Pending, Action::Cancel);
            assert_eq!(cancelled.text, "  ✘ write report @cancelled (16-12-31 23:00)");
        }

        #[test]
        fn round_trip_is_byte_identical() {
            let tagless = Settings {
                done_tag: false,
                ..Settings::default()
            };
            for s in [Settings::default(), tagless] {
                for line in [
                    "☐ plain",
                    "    ☐ nested @due(17-01-05 10:00) @high",
                    "\t☐\ttabbed",
                    "☐ keeps a hard break  ",
                    "☐ mail bob@example.com",
                    "☐ call (see notes)",
                ] {
                    let done = rewrite(&s, line, LineKind::Pending, Action::Complete);
                    let back = rewrite(&s, &done.text, LineKind::Completed, Action::Complete);
                    assert_eq!(back.text, line, "done_tag = {}", s.done_tag);
                    assert_eq!(done.column_shift + back.column_shift, 0);

                    let cancelled = rewrite(&s, line, LineKind::Pending, Action::Cancel);
                    let back = rewrite(&s, &cancelled.text, LineKind::Cancelled, Action::Cancel);
                    assert_eq!(back.text, line, "done_tag = {}", s.done_tag);
                }
            }
        }

        #[test]
        fn tagless_reopen_keeps_groups_that_are_not_stamps() {
            let s = Settings {
                done_tag: false,
                ..Settings::default()
            };
            let back = rewrite(&s, "✔ x (see notes)", LineKind::Completed, Action::Complete);
            assert_eq!(back.text, "☐ x (see notes)");

            let back = rewrite(
                &s,
                "✔ x  (16-12-31 23:00) @lasted(1:00) @high",
                LineKind::Completed,
                Action::Complete,
            );
            assert_eq!(back.text, "☐ x @high");
        }

        #[test]
        fn started_tasks_get_elapsed_time() {
            let s = Settings::default();
            let done = rewrite(
                &s,
                "☐ deploy @started(16-12-31 21:30)",
                LineKind::Pending,
                Action::Complete,
            );
            assert_eq!(
                done.text,
                "✔ deploy @started(16-12-31 21:30) @done (16-12-31 23:00) @lasted(1:30)"
            );

            let wasted = rewrite(
                &s,
                "☐ meeting @started(16-12-30 20:00) @toggle(16-12-30 21:00) @toggle(16-12-31 22:00)",
                LineKind::Pending,
                Action::Cancel,
            );
            assert!(wasted.text.ends_with("@cancelled (16-12-31 23:00) @wasted(2:00)"));
        }

        #[test]
        fn zero_elapsed_uses_fallback_phrase() {
            let s = Settings::default();
            let done = rewrite(
                &s,
                "☐ blink @started(16-12-31 23:00)",
                LineKind::Pending,
                Action::Complete,
            );
            assert!(done.text.ends_with("@lasted(a bit)"), "{}", done.text);
        }

        #[test]
        fn decimal_minutes_setting() {
            let s = Settings {
                decimal_minutes: true,
                ..Settings::default()
            };
            let done = rewrite(
                &s,
                "☐ call @started(16-12-31 21:52)",
                LineKind::Pending,
                Action::Complete,
            );
            assert!(done.text.ends_with("@lasted(1.13)"), "{}", done.text);
        }

        #[test]
        fn unreadable_start_is_reported_not_fatal() {
            let s = Settings::default();
            let done = rewrite(&s, "☐ x @started(someday)", LineKind::Pending, Action::Complete);
            assert_eq!(done.text, "✔ x @started(someday) @done (16-12-31 23:00)");
            assert!(matches!(done.notices.as_slice(), [Notice::UnreadableTimestamp { .. }]));
        }

        #[test]
        fn reopening_keeps_explanations_and_later_tags() {
            let s = Settings::default();
            let back = rewrite(
                &s,
                "✔ call bob @done (waiting on him) @project(Home)",
                LineKind::Completed,
                Action::Complete,
            );
            assert_eq!(back.text, "☐ call bob (waiting on him) @project(Home)");

            let back = rewrite(
                &s,
                "✘ work @started(16-12-31 21:00) @cancelled (16-12-31 23:00) @wasted(2:00) @project(Job)",
                LineKind::Cancelled,
                Action::Cancel,
            );
            assert_eq!(back.text, "☐ work @started(16-12-31 21:00) @project(Job)");
        }

        #[test]
        fn finished_line_without_tag_just_reopens() {
            let s = Settings::default();
            let back = rewrite(&s, "  [x] legacy", LineKind::Completed, Action::Complete);
            assert_eq!(back.text, "  ☐ legacy");
            assert_eq!(back.column_shift, -2);
        }

        #[test]
        fn cancelling_completed_is_refused() {
            let s = Settings::default();
            let outcome = Transition::new(&s, now()).apply(
                "✔ done already @done (16-12-30 10:00)",
                LineKind::Completed,
                Action::Cancel,
            );
            assert_eq!(outcome, Outcome::Refused(Notice::CancelCompleted));
        }

        #[test]
        fn completing_cancelled_switches_state() {
            let s = Settings::default();
            let done = rewrite(
                &s,
                "✘ call @cancelled (16-12-30 10:00)",
                LineKind::Cancelled,
                Action::Complete,
            );
            assert_eq!(done.text, "✔ call @done (16-12-31 23:00)");
        }

        #[test]
        fn headers_gain_and_lose_a_bullet() {
            let s = Settings::default();
            let done = rewrite(&s, "  Launch:", LineKind::Header, Action::Complete);
            assert_eq!(done.text, "  ✔ Launch: @done (16-12-31 23:00)");
            assert_eq!(done.column_shift, 2);
            assert!(done.recompute_total);

            let back = rewrite(&s, &done.text, LineKind::Header, Action::Complete);
            assert_eq!(back.text, "  Launch:");
            assert_eq!(back.column_shift, -2);

            let outcome =
                Transition::new(&s, now()).apply(&done.text, LineKind::Header, Action::Cancel);
            assert_eq!(outcome, Outcome::Refused(Notice::CancelCompleted));
        }

        #[test]
        fn other_lines_are_untouched() {
            let s = Settings::default();
            let t = Transition::new(&s, now());
            for kind in [LineKind::Note, LineKind::Empty, LineKind::Separator] {
                assert_eq!(t.apply("whatever", kind, Action::Complete), Outcome::Untouched);
            }
        }

        #[test]
        fn taskpaper_and_tagless_styles() {
            let s = Settings {
                taskpaper_compatible: true,
                ..Settings::default()
            };
            let done = rewrite(&s, "- buy milk", LineKind::Pending, Action::Complete);
            assert_eq!(done.text, "- buy milk @done(16-12-31 23:00)");
            let back = rewrite(&s, &done.text, LineKind::Completed, Action::Complete);
            assert_eq!(back.text, "- buy milk");

            let s = Settings {
                done_tag: false,
                ..Settings::default()
            };
            let done = rewrite(&s, "☐ x", LineKind::Pending, Action::Complete);
            assert_eq!(done.text, "✔ x  (16-12-31 23:00)");
        }
    }
}

pub mod engine {
    //! Document-level operations. Multi-line edits always run bottom-to-top so the
    //! indices of lines still waiting to be processed stay valid.

    use crate::config::Settings;
    use crate::model::{Classifier, Document, LineError, LineKind, LineNotice};
    use crate::dates::{expand_short_date, format_timestamp, parse_stamp};
    use crate::duration::{format_delta, parse_duration, zero_fallback};
    use crate::grammar::{
        HARD_BREAK, OutlineClassifier, TaskLine, Tags, indent_width, remove_tags, scan_tags,
        split_hard_break, split_indent,
    };
    use crate::projects::{
        ProjectPath, block_end, collect_markers, resolve_project_path,
    };
    use crate::transition::{Action, Outcome, Transition};
    use chrono::{Duration, NaiveDateTime};
    use serde::Serialize;

    /// Separator written above a newly created archive section.
    pub const ARCHIVE_SEPARATOR: &str = "＿＿＿＿＿＿＿＿＿＿＿＿＿＿＿＿＿＿＿";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct Cursor {
        pub line: usize,
        pub column: usize,
    }

    /// What a batch operation did. Problems on one line never stop the others.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct Report {
        pub changed: Vec<usize>,
        pub notices: Vec<LineNotice>,
        pub errors: Vec<LineError>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum DueStatus {
        Overdue,
        DueSoon,
        Upcoming,
        Misformatted,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct DueEntry {
        pub line: usize,
        pub status: DueStatus,
        pub due: Option<NaiveDateTime>,
        pub text: String,
    }

    /// Sum that skips a span which would overflow.
    fn add_span(total: Duration, span: Duration, line: usize) -> Duration {
        total.checked_add(&span).unwrap_or_else(|| {
            tracing::warn!(line, %span, "elapsed time overflows the total, skipping it");
            total
        })
    }

    fn bottom_up(lines: impl IntoIterator<Item = usize>) -> Vec<usize> {
        let mut lines: Vec<usize> = lines.into_iter().collect();
        lines.sort_unstable_by(|a, b| b.cmp(a));
        lines.dedup();
        lines
    }

    fn width(text: &str) -> usize {
        text.chars().count()
    }

    pub struct Engine<'a, C> {
        settings: &'a Settings,
        classifier: C,
    }

    impl<'a> Engine<'a, OutlineClassifier<'a>> {
        /// Engine that classifies lines by their text alone.
        pub fn outline(settings: &'a Settings) -> Self {
            Self::new(settings, OutlineClassifier::new(settings))
        }
    }

    impl<'a, C: Classifier> Engine<'a, C> {
        pub fn new(settings: &'a Settings, classifier: C) -> Self {
            Self {
                settings,
                classifier,
            }
        }

        pub fn settings(&self) -> &Settings {
            self.settings
        }

        pub fn kinds(&self, doc: &Document) -> Vec<LineKind> {
            doc.lines().map(|l| self.classifier.classify_line(l)).collect()
        }

        fn stamp_tag(&self, name: &str, at: NaiveDateTime) -> String {
            let stamp = format_timestamp(at, &self.settings.date_format, &self.settings.locale);
            if stamp.starts_with('(') {
                format!("@{name}{stamp}")
            } else {
                format!("@{name}({stamp})")
            }
        }

        /* ------------------------------ Toggling ------------------------------ */

        /// Complete or cancel every line holding a cursor.
        pub fn toggle(
            &self,
            doc: &mut Document,
            cursors: &mut [Cursor],
            action: Action,
            now: NaiveDateTime,
        ) -> Report {
            let transition = Transition::new(self.settings, now);
            let mut report = Report::default();
            for line in bottom_up(cursors.iter().map(|c| c.line)) {
                let Some(text) = doc.line(line) else {
                    continue;
                };
                let kind = self.classifier.classify_line(text);
                let prefix = TaskLine::parse(text, self.settings).prefix_width();
                match transition.apply(text, kind, action) {
                    Outcome::Rewritten(rewrite) => {
                        doc.set_line(line, rewrite.text);
                        let moved = cursors
                            .iter_mut()
                            .filter(|c| c.line == line && c.column >= prefix);
                        for cursor in moved {
                            cursor.column = cursor.column.saturating_add_signed(rewrite.column_shift);
                        }
                        report
                            .notices
                            .extend(rewrite.notices.into_iter().map(|notice| LineNotice { line, notice }));
                        report.changed.push(line);
                        if rewrite.recompute_total {
                            self.refresh_total(doc, line);
                        }
                    }
                    Outcome::Refused(notice) => report.notices.push(LineNotice { line, notice }),
                    Outcome::Untouched => tracing::debug!(line, ?kind, "nothing to toggle"),
                }
            }
            report
        }

        /* ------------------------------- Totals ------------------------------- */

        /// Time recorded under `header`. A nested header carrying `@total` counts
        /// once through that tag and its own block is skipped.
        pub fn block_total(&self, doc: &Document, header: usize) -> Duration {
            let end = block_end(doc, header);
            let mut total = Duration::zero();
            let mut idx = header + 1;
            while idx < end {
                let Some(text) = doc.line(idx) else {
                    break;
                };
                let tags = Tags::scan(text);
                if self.classifier.classify_line(text) == LineKind::Header {
                    if let Some(value) = tags.first("total").and_then(|t| t.value()) {
                        let span = parse_duration(value).unwrap_or_else(Duration::zero);
                        total = add_span(total, span, idx);
                        idx = block_end(doc, idx);
                        continue;
                    }
                }
                for name in ["lasted", "wasted"] {
                    for tag in tags.all(name) {
                        if let Some(span) = tag.value().and_then(parse_duration) {
                            total = add_span(total, span, idx);
                        }
                    }
                }
                idx += 1;
            }
            total
        }

        /// Replace the header's `@total(...)`. An open header with an empty total gets
        /// no tag; a closed one gets the fallback phrase, since `@total` marks it.
        pub fn refresh_total(&self, doc: &mut Document, header: usize) -> Option<Duration> {
            let total = self.block_total(doc, header);
            let (content, hard) = split_hard_break(doc.line(header)?);
            let closed = TaskLine::parse(content, self.settings).bullet_kind().is_some();
            let mut updated = remove_tags(content, &["total"]).trim_end().to_string();
            let mut rendered = format_delta(total, self.settings.decimal_minutes);
            if rendered.is_empty() && closed {
                rendered = zero_fallback(&self.settings.date_format).to_string();
            }
            if !rendered.is_empty() {
                updated.push_str(&format!(" @total({rendered})"));
            }
            if hard {
                updated.push_str(HARD_BREAK);
            }
            doc.set_line(header, updated);
            Some(total)
        }

        /* ------------------------------ Projects ------------------------------ */

        pub fn project_path(&self, doc: &Document, line: usize) -> ProjectPath {
            let markers = collect_markers(doc, &self.classifier, self.settings);
            let indent = doc.line(line).map_or(0, indent_width);
            resolve_project_path(line, indent, &markers)
        }

        /// Move finished tasks above the archive section, with the notes they own,
        /// to the top of that section. The section is created when missing.
        pub fn archive(&self, doc: &mut Document) -> Report {
            let archive_name = self.settings.archive_name.trim();
            let archive_at = doc.lines().position(|l| l.trim() == archive_name);
            let limit = archive_at.unwrap_or(doc.len());
            let is_note_under = |line: &str, indent: usize| {
                self.classifier.classify_line(line) == LineKind::Note && indent_width(line) > indent
            };

            let mut groups = Vec::new();
            let mut idx = 0;
            while idx < limit {
                let Some(text) = doc.line(idx) else {
                    break;
                };
                if !self.classifier.classify_line(text).is_finished() {
                    idx += 1;
                    continue;
                }
                let indent = indent_width(text);
                let mut end = idx + 1;
                while end < limit && doc.line(end).is_some_and(|l| is_note_under(l, indent)) {
                    end += 1;
                }
                groups.push(idx..end);
                idx = end;
            }
            if groups.is_empty() {
                return Report::default();
            }

            let markers = collect_markers(doc, &self.classifier, self.settings);
            let spaces = self.settings.before_tasks_bullet_spaces();
            let mut archived = Vec::new();
            for group in &groups {
                let task = doc.line(group.start).unwrap_or_default();
                let (content, hard) = split_hard_break(task);
                let (task_indent, body) = split_indent(content);
                let mut entry = format!("{spaces}{body}");
                if self.settings.project_tag && !Tags::scan(body).contains("project") {
                    let path = resolve_project_path(group.start, indent_width(task), &markers);
                    if let Some(tag) = path.tag() {
                        entry.push(' ');
                        entry.push_str(&tag);
                    }
                }
                if hard {
                    entry.push_str(HARD_BREAK);
                }
                archived.push(entry);
                for note in group.clone().skip(1).filter_map(|i| doc.line(i)) {
                    let relative = note
                        .strip_prefix(task_indent)
                        .unwrap_or_else(|| note.trim_start());
                    archived.push(format!("{spaces}{relative}"));
                }
            }

            let removed: usize = groups.iter().map(|g| g.len()).sum();
            for group in groups.iter().rev() {
                doc.remove_lines(group.clone());
            }
            let insert_at = match archive_at {
                Some(at) => at - removed + 1,
                None => {
                    if doc.lines().last().is_some_and(|l| !l.trim().is_empty()) {
                        doc.push_line(String::new());
                    }
                    doc.push_line(ARCHIVE_SEPARATOR.to_string());
                    doc.push_line(self.settings.archive_name.clone());
                    doc.len()
                }
            };
            let count = archived.len();
            doc.insert_lines(insert_at, archived);
            tracing::debug!(tasks = groups.len(), lines = count, "archived");
            Report {
                changed: (insert_at..insert_at + count).collect(),
                ..Report::default()
            }
        }

        /* ------------------------------- Dates ------------------------------- */

        /// Rewrite short date expressions inside the configured tags
        /// (`@due(+1w)` becomes `@due(17-01-07 23:00)`). `None` means every line.
        pub fn expand_short_dates(
            &self,
            doc: &mut Document,
            lines: Option<&[usize]>,
            now: NaiveDateTime,
        ) -> Report {
            let targets = match lines {
                Some(lines) => bottom_up(lines.iter().copied()),
                None => bottom_up(0..doc.len()),
            };
            let format = &self.settings.date_format;
            let locale = &self.settings.locale;
            let mut report = Report::default();
            for line in targets {
                let Some(text) = doc.line(line) else {
                    continue;
                };
                let mut updated = text.to_string();
                let mut changed = false;
                let tags = scan_tags(text);
                for tag in tags.iter().rev() {
                    if !self.settings.expand_tags.iter().any(|t| t == tag.name) {
                        continue;
                    }
                    let (Some(group), Some(value)) = (tag.group, tag.value()) else {
                        continue;
                    };
                    let expression = value.is_empty()
                        || value.contains(|c: char| c.is_ascii_digit() || c == '+');
                    if !expression || parse_stamp(group, format, locale).is_ok() {
                        continue;
                    }
                    match expand_short_date(value, now, text, format, locale) {
                        Ok(expansion) => {
                            updated.replace_range(tag.span.clone(), &self.stamp_tag(tag.name, expansion.date));
                            if let Some(notice) = expansion.notice {
                                report.notices.push(LineNotice { line, notice });
                            }
                            changed = true;
                        }
                        Err(error) => report.errors.push(LineError { line, error }),
                    }
                }
                if changed {
                    doc.set_line(line, updated);
                    report.changed.push(line);
                }
            }
            report
        }

        /// `@due` dates of open lines against one reference time.
        pub fn due_report(&self, doc: &Document, now: NaiveDateTime) -> Vec<DueEntry> {
            let threshold = self.settings.due_soon_threshold();
            let mut entries = Vec::new();
            for (line, text) in doc.lines().enumerate() {
                if self.classifier.classify_line(text).is_finished() {
                    continue;
                }
                let tags = Tags::scan(text);
                for tag in tags.all("due") {
                    let group = tag.group.unwrap_or_default();
                    let parsed = parse_stamp(group, &self.settings.date_format, &self.settings.locale);
                    let (status, due) = match parsed {
                        Ok(due) if now >= due => (DueStatus::Overdue, Some(due)),
                        Ok(due) if threshold > Duration::zero() && due - now < threshold => {
                            (DueStatus::DueSoon, Some(due))
                        }
                        Ok(due) => (DueStatus::Upcoming, Some(due)),
                        Err(_) => (DueStatus::Misformatted, None),
                    };
                    entries.push(DueEntry {
                        line,
                        status,
                        due,
                        text: text.trim().to_string(),
                    });
                }
            }
            entries
        }

        /* ------------------------------- Timers ------------------------------- */

        /// Add `@started(now)` to open tasks, or `@toggle(now)` when already started.
        pub fn start_timer(&self, doc: &mut Document, lines: &[usize], now: NaiveDateTime) -> Report {
            let mut report = Report::default();
            for line in bottom_up(lines.iter().copied()) {
                let Some(text) = doc.line(line) else {
                    continue;
                };
                if self.classifier.classify_line(text) != LineKind::Pending {
                    tracing::debug!(line, "timers only run on open tasks");
                    continue;
                }
                let name = if Tags::scan(text).contains("started") {
                    "toggle"
                } else {
                    "started"
                };
                let (content, hard) = split_hard_break(text);
                let mut updated = format!("{content} {}", self.stamp_tag(name, now));
                if hard {
                    updated.push_str(HARD_BREAK);
                }
                doc.set_line(line, updated);
                report.changed.push(line);
            }
            report
        }

        /* ------------------------------ New task ------------------------------ */

        /// Open a task at the cursor line and return where typing continues: below a
        /// task or header, or in place on a note or blank line.
        pub fn new_task(&self, doc: &mut Document, cursor: Cursor) -> Cursor {
            let open = self.settings.bullets().open;
            let space = self.settings.tasks_bullet_space();
            let Some(text) = doc.line(cursor.line).map(str::to_string) else {
                let entry = format!("{open}{space}");
                let column = width(&entry);
                doc.push_line(entry);
                return Cursor {
                    line: doc.len() - 1,
                    column,
                };
            };
            let parts = TaskLine::parse(&text, self.settings);
            let kind = self.classifier.classify_line(&text);
            let (line, entry, insert) = match kind {
                _ if kind.is_task() => (cursor.line + 1, format!("{}{open}{space}", parts.indent), true),
                LineKind::Header => {
                    let spaces = self.settings.before_tasks_bullet_spaces();
                    (cursor.line + 1, format!("{}{spaces}{open}{space}", parts.indent), true)
                }
                LineKind::Empty => {
                    let (indent, _) = split_indent(&text);
                    (cursor.line, format!("{indent}{open}{space}"), false)
                }
                _ => (
                    cursor.line,
                    format!("{}{open}{space}{}", parts.indent, parts.content),
                    false,
                ),
            };
            let column = width(&entry);
            if insert {
                doc.insert_lines(line, vec![entry]);
            } else {
                doc.set_line(line, entry);
            }
            Cursor { line, column }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::model::Notice;
        use chrono::NaiveDate;

        fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(y, m, d)
                .expect("valid date")
                .and_hms_opt(h, min, 0)
                .expect("valid time")
        }

        fn now() -> NaiveDateTime {
            at(2016, 12, 31, 23, 0)
        }

        #[test]
        fn toggles_several_lines_and_moves_cursors() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse("Home:\n  [ ] dishes\n  ☐ laundry\n  note\n");
            let mut cursors = [
                Cursor { line: 1, column: 8 },
                Cursor { line: 2, column: 4 },
                Cursor { line: 3, column: 0 },
                Cursor { line: 1, column: 6 },
            ];
            let report = engine.toggle(&mut doc, &mut cursors, Action::Complete, now());
            assert_eq!(report.changed, vec![2, 1]);
            assert_eq!(
                doc.render(),
                "Home:\n  ✔ dishes @done (16-12-31 23:00)\n  ✔ laundry @done (16-12-31 23:00)\n  note\n"
            );
            assert_eq!(cursors[0].column, 6);
            assert_eq!(cursors[1].column, 4);
            assert_eq!(cursors[2].column, 0);
            assert_eq!(cursors[3].column, 4);
        }

        #[test]
        fn cursors_inside_the_indent_stay_put() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse("  [ ] dishes
");
            let mut cursors = [Cursor { line: 0, column: 1 }, Cursor { line: 0, column: 7 }];
            engine.toggle(&mut doc, &mut cursors, Action::Complete, now());
            assert_eq!(doc.line(0), Some("  ✔ dishes @done (16-12-31 23:00)"));
            assert_eq!(cursors[0].column, 1);
            assert_eq!(cursors[1].column, 5);
        }

        #[test]
        fn task_ending_in_a_colon_toggles_back() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse("☐ Ask about:\n");
            let mut cursors = [Cursor { line: 0, column: 0 }];
            engine.toggle(&mut doc, &mut cursors, Action::Complete, now());
            assert_eq!(doc.render(), "✔ Ask about: @done (16-12-31 23:00)\n");
            engine.toggle(&mut doc, &mut cursors, Action::Complete, now());
            assert_eq!(doc.render(), "☐ Ask about:\n");
        }

        #[test]
        fn closed_header_keeps_a_total_marker() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse("Idle:\n  ☐ nothing yet\n");
            let mut cursors = [Cursor { line: 0, column: 0 }];
            engine.toggle(&mut doc, &mut cursors, Action::Complete, now());
            assert_eq!(doc.line(0), Some("✔ Idle: @done (16-12-31 23:00) @total(a bit)"));
            assert_eq!(engine.kinds(&doc)[0], LineKind::Header);

            engine.toggle(&mut doc, &mut cursors, Action::Complete, now());
            assert_eq!(doc.line(0), Some("Idle: @total(a bit)"));
        }

        #[test]
        fn refusal_is_reported_per_line() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse("✔ shipped @done (16-12-30 10:00)\n☐ next\n");
            let mut cursors = [Cursor { line: 0, column: 0 }, Cursor { line: 1, column: 0 }];
            let report = engine.toggle(&mut doc, &mut cursors, Action::Cancel, now());
            assert_eq!(report.changed, vec![1]);
            assert_eq!(
                report.notices,
                vec![LineNotice {
                    line: 0,
                    notice: Notice::CancelCompleted
                }]
            );
            assert_eq!(doc.line(1), Some("✘ next @cancelled (16-12-31 23:00)"));
        }

        #[test]
        fn completing_a_header_writes_its_total() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse(
                "Project:\n  ✔ a @done (16-12-31 10:00) @lasted(1:00)\n\n  ✘ b @cancelled (16-12-31 11:00) @wasted(0:30)\n  Sub: @total(2:00)\n    ✔ c @lasted(2:00)\nOther:\n  ✔ d @lasted(5:00)\n",
            );
            let mut cursors = [Cursor { line: 0, column: 0 }];
            engine.toggle(&mut doc, &mut cursors, Action::Complete, now());
            assert_eq!(
                doc.line(0),
                Some("✔ Project: @done (16-12-31 23:00) @total(3:30)")
            );
            assert_eq!(cursors[0].column, 2);
        }

        #[test]
        fn refresh_replaces_previous_total() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse("Work: @total(9:00)  \n  ✔ a @lasted(1 day, 2:00)\n");
            assert_eq!(engine.refresh_total(&mut doc, 0), Some(Duration::hours(26)));
            assert_eq!(doc.line(0), Some("Work: @total(1 day, 2:00)  "));

            let mut empty = Document::parse("Idle: @total(1:00)\n  ☐ nothing yet\n");
            engine.refresh_total(&mut empty, 0);
            assert_eq!(empty.line(0), Some("Idle:"));
        }

        #[test]
        fn total_skips_spans_that_overflow() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse(
                "P:\n  ✔ a @lasted(100000000000 days)\n  ✔ b @lasted(100000000000 days)\n",
            );
            assert_eq!(
                engine.refresh_total(&mut doc, 0),
                Some(Duration::days(100_000_000_000))
            );
            assert_eq!(doc.line(0), Some("P: @total(100000000000 days)"));
        }

        #[test]
        fn archives_finished_tasks_with_notes_and_paths() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse(
                "Home:\n  ☐ keep\n  ✔ fix sink @done (16-12-30 10:00)\n      note about sink\n  Garden:\n    ✘ mow @cancelled (16-12-30 11:00)\n☐ loose\n",
            );
            let report = engine.archive(&mut doc);
            assert_eq!(
                doc.render(),
                format!(
                    "Home:\n  ☐ keep\n  Garden:\n☐ loose\n\n{ARCHIVE_SEPARATOR}\nArchive:\n\t✔ fix sink @done (16-12-30 10:00) @project(Home)\n\t    note about sink\n\t✘ mow @cancelled (16-12-30 11:00) @project(Home / Garden)\n"
                )
            );
            assert_eq!(report.changed, vec![7, 8, 9]);
        }

        #[test]
        fn archives_into_existing_section() {
            let settings = Settings {
                translate_tabs_to_spaces: true,
                before_tasks_bullet_margin: 2,
                ..Settings::default()
            };
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse(
                "Work:\n  ✔ report @done (16-12-30 10:00) @project(Old)\n＿＿＿＿\nArchive:\n  ✔ older @done (16-12-01 10:00) @project(Work)\n",
            );
            engine.archive(&mut doc);
            assert_eq!(
                doc.render(),
                "Work:\n＿＿＿＿\nArchive:\n  ✔ report @done (16-12-30 10:00) @project(Old)\n  ✔ older @done (16-12-01 10:00) @project(Work)\n"
            );
            assert_eq!(engine.archive(&mut doc), Report::default());
        }

        #[test]
        fn expands_short_dates_in_due_tags() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse(
                "☐ rent @due(+1w) @created(16.12.1)\n☐ plants @created(16.12.1) @due(++)\n☐ call @due(++)\n☐ fixed @due(17-01-05 10:00)\n☐ bad @due(2-29)\n☐ word @due(soon)\n",
            );
            let report = engine.expand_short_dates(&mut doc, None, now());
            assert_eq!(doc.line(0), Some("☐ rent @due(17-01-07 23:00) @created(16.12.1)"));
            assert_eq!(doc.line(1), Some("☐ plants @created(16.12.1) @due(16-12-02 23:00)"));
            assert_eq!(doc.line(2), Some("☐ call @due(17-01-01 23:00)"));
            assert_eq!(doc.line(3), Some("☐ fixed @due(17-01-05 10:00)"));
            assert_eq!(doc.line(4), Some("☐ bad @due(2-29)"));
            assert_eq!(doc.line(5), Some("☐ word @due(soon)"));
            assert_eq!(report.changed, vec![2, 1, 0]);
            assert!(matches!(
                report.notices.as_slice(),
                [LineNotice { line: 2, notice: Notice::MissingCreatedReference { .. } }]
            ));
            assert_eq!(report.errors.len(), 1);
            assert_eq!(report.errors[0].line, 4);
        }

        #[test]
        fn classifies_due_dates_with_one_reference_time() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let doc = Document::parse(
                "☐ a @due(16-12-30 10:00)\n☐ b @due(17-01-01 10:00)\n☐ c @due(17-02-01 10:00)\n☐ d @due(tomorrow)\n✔ e @due(16-12-01 10:00) @done (16-12-02 10:00)\n",
            );
            let statuses: Vec<_> = engine
                .due_report(&doc, now())
                .into_iter()
                .map(|e| (e.line, e.status))
                .collect();
            assert_eq!(
                statuses,
                vec![
                    (0, DueStatus::Overdue),
                    (1, DueStatus::DueSoon),
                    (2, DueStatus::Upcoming),
                    (3, DueStatus::Misformatted),
                ]
            );

            let never_soon = Settings {
                highlight_due_soon: 0,
                ..Settings::default()
            };
            let engine = Engine::outline(&never_soon);
            assert_eq!(engine.due_report(&doc, now())[1].status, DueStatus::Upcoming);
        }

        #[test]
        fn timers_start_then_toggle() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse("☐ write  \nNotes:\n");
            engine.start_timer(&mut doc, &[0, 1], now());
            assert_eq!(doc.line(0), Some("☐ write @started(16-12-31 23:00)  "));
            assert_eq!(doc.line(1), Some("Notes:"));
            engine.start_timer(&mut doc, &[0], at(2016, 12, 31, 23, 30));
            assert_eq!(
                doc.line(0),
                Some("☐ write @started(16-12-31 23:00) @toggle(16-12-31 23:30)  ")
            );
        }

        #[test]
        fn new_task_follows_the_cursor_line() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse("Home:\n  ☐ dishes\nbuy milk\n\n");

            let cursor = engine.new_task(&mut doc, Cursor { line: 1, column: 0 });
            assert_eq!(cursor, Cursor { line: 2, column: 4 });
            assert_eq!(doc.line(2), Some("  ☐\t"));

            let cursor = engine.new_task(&mut doc, Cursor { line: 0, column: 0 });
            assert_eq!(cursor, Cursor { line: 1, column: 3 });
            assert_eq!(doc.line(1), Some("\t☐\t"));

            let cursor = engine.new_task(&mut doc, Cursor { line: 4, column: 0 });
            assert_eq!(doc.line(4), Some("☐\tbuy milk"));
            assert_eq!(cursor.column, 10);

            let cursor = engine.new_task(&mut doc, Cursor { line: 5, column: 0 });
            assert_eq!(doc.line(5), Some("☐\t"));
            assert_eq!(cursor, Cursor { line: 5, column: 2 });
        }

        #[test]
        fn new_task_with_translated_tabs_uses_spaces() {
            let settings = Settings {
                translate_tabs_to_spaces: true,
                ..Settings::default()
            };
            let engine = Engine::outline(&settings);
            let mut doc = Document::parse("Home:\n");
            let cursor = engine.new_task(&mut doc, Cursor { line: 0, column: 0 });
            let margin = " ".repeat(settings.before_tasks_bullet_margin);
            assert_eq!(doc.line(1).map(str::to_string), Some(format!("{margin}☐ ")));
            assert_eq!(cursor.column, settings.before_tasks_bullet_margin + 2);
        }

        #[test]
        fn resolves_project_path_for_a_line() {
            let settings = Settings::default();
            let engine = Engine::outline(&settings);
            let doc = Document::parse("Outer:\n  Inner:\n    ☐ task\n");
            assert_eq!(engine.project_path(&doc, 2).to_string(), "Outer / Inner");
        }
    }
}

pub use config::Settings;
pub use model::{Classifier, Document, LineKind};
pub use engine::{Cursor, Engine, Report};
pub use grammar::OutlineClassifier;
pub use transition::{Action, Outcome, Transition};
