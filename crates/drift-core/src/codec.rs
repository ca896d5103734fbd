//! Line-oriented change-set format.
//!
//! ```text
//! <definition-name>
//! <base-directory>
//! <category-code> <version> <created-millis>
//! <directory> <entry-count>
//! <new-digest-or-0> <old-digest-or-0> <file> <change-code>
//! <blank line>
//! ```
//!
//! Fields are separated by a single space, so names containing spaces (or
//! line breaks) cannot be encoded and are rejected. Readers ignore extra
//! trailing tokens on any line; new fields may only ever be appended.

use chrono::{DateTime, TimeZone, Utc};
use std::io::{BufRead, Write};

use crate::changeset::{Category, ChangeKind, ChangeSet, DirectoryEntry, FileEntry};
use crate::errors::{DriftError, FormatIssue, Result};
use crate::hasher::Digest;

/// Marker written in place of an absent digest. Real digests are always 64
/// hex characters, so this never collides with one.
pub const ABSENT_DIGEST: &str = "0";

// ── Encoding ────────────────────────────────────────────────────────────────

pub fn encode(change_set: &ChangeSet) -> Result<String> {
    let mut out = Vec::new();
    write_change_set(change_set, &mut out)?;
    String::from_utf8(out).map_err(|e| DriftError::Config(e.to_string()))
}

pub fn write_change_set<W: Write>(change_set: &ChangeSet, out: &mut W) -> Result<()> {
    check_field(&change_set.definition, false)?;
    check_field(&change_set.base_dir, true)?;

    let mut buf = String::new();
    buf.push_str(&change_set.definition);
    buf.push('\n');
    buf.push_str(&change_set.base_dir);
    buf.push('\n');
    buf.push_str(&format!(
        "{} {} {}\n",
        change_set.category.code(),
        change_set.version,
        change_set.created_at.timestamp_millis()
    ));

    for dir in &change_set.directories {
        check_field(&dir.directory, false)?;
        buf.push_str(&format!("{} {}\n", dir.directory, dir.declared_count()));
        for entry in &dir.files {
            check_field(&entry.file, false)?;
            if !entry.is_consistent() {
                return Err(DriftError::format(
                    0,
                    FormatIssue::InvalidEntry {
                        file: dir.full_path(entry),
                        kind: format!("{:?}", entry.kind),
                    },
                ));
            }
            buf.push_str(&format!(
                "{} {} {} {}\n",
                digest_field(&entry.new_digest),
                digest_field(&entry.old_digest),
                entry.file,
                entry.kind.code()
            ));
        }
        buf.push('\n');
    }

    out.write_all(buf.as_bytes())
        .and_then(|_| out.flush())
        .map_err(|e| DriftError::io("<change-set writer>", e))
}

/// The base directory is a header line of its own and may hold spaces;
/// every other field is space-delimited.
fn check_field(value: &str, spaces_allowed: bool) -> Result<()> {
    let bad_space = !spaces_allowed && value.contains(' ');
    if value.is_empty() || bad_space || value.contains(['\n', '\r']) {
        return Err(DriftError::UnencodablePath(value.to_string()));
    }
    Ok(())
}

fn digest_field(digest: &Option<Digest>) -> String {
    match digest {
        Some(d) => d.to_hex(),
        None => ABSENT_DIGEST.to_string(),
    }
}

// ── Decoding ────────────────────────────────────────────────────────────────

/// Header lines of a change-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    pub definition: String,
    pub base_dir: String,
    pub category: Category,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

pub fn decode(input: &str) -> Result<ChangeSet> {
    read_change_set(input.as_bytes())
}

pub fn read_change_set<R: BufRead>(input: R) -> Result<ChangeSet> {
    let mut reader = ChangeSetReader::new(input)?;
    let mut directories = Vec::new();
    while let Some(dir) = reader.read_directory_entry()? {
        directories.push(dir);
    }
    let headers = reader.into_headers();
    Ok(ChangeSet {
        definition: headers.definition,
        base_dir: headers.base_dir,
        category: headers.category,
        version: headers.version,
        created_at: headers.created_at,
        directories,
    })
}

/// Streaming reader yielding one directory entry at a time, so large
/// coverage change-sets need not be held in memory at once.
pub struct ChangeSetReader<R: BufRead> {
    input: R,
    line_no: usize,
    headers: Headers,
    done: bool,
}

impl<R: BufRead> ChangeSetReader<R> {
    pub fn new(input: R) -> Result<Self> {
        let mut reader = Self {
            input,
            line_no: 0,
            headers: Headers {
                definition: String::new(),
                base_dir: String::new(),
                category: Category::Coverage,
                version: 0,
                created_at: epoch(),
            },
            done: false,
        };
        reader.headers = reader.read_headers()?;
        Ok(reader)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn into_headers(self) -> Headers {
        self.headers
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self
            .input
            .read_line(&mut line)
            .map_err(|e| DriftError::io("<change-set reader>", e))?;
        if n == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }

    fn require_line(&mut self, what: &'static str) -> Result<String> {
        match self.next_line()? {
            Some(line) if !line.is_empty() => Ok(line),
            Some(_) => Err(DriftError::format(self.line_no, FormatIssue::MissingHeader(what))),
            None => Err(DriftError::format(
                self.line_no + 1,
                FormatIssue::MissingHeader(what),
            )),
        }
    }

    fn read_headers(&mut self) -> Result<Headers> {
        let definition = self.require_line("definition name")?;
        let base_dir = self.require_line("base directory")?;
        let category_line = self.require_line("category")?;

        let mut tokens = category_line.split(' ');
        let code = tokens.next().unwrap_or_default();
        let category = Category::from_code(code).ok_or_else(|| {
            DriftError::format(self.line_no, FormatIssue::UnknownCategory(code.to_string()))
        })?;

        // Writers predating the version fields emit a bare code.
        let version = match tokens.next() {
            Some(v) => self.parse_number::<u32>(v)?,
            None => 0,
        };
        let created_at = match tokens.next() {
            Some(ms) => {
                let ms = self.parse_number::<i64>(ms)?;
                Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
                    DriftError::format(self.line_no, FormatIssue::InvalidNumber(ms.to_string()))
                })?
            }
            None => epoch(),
        };

        Ok(Headers {
            definition,
            base_dir,
            category,
            version,
            created_at,
        })
    }

    /// Next directory block, or `None` at a clean end of input.
    pub fn read_directory_entry(&mut self) -> Result<Option<DirectoryEntry>> {
        if self.done {
            return Ok(None);
        }
        let line = match self.next_line()? {
            Some(line) => line,
            None => {
                self.done = true;
                return Ok(None);
            }
        };
        if line.is_empty() {
            return Err(DriftError::format(
                self.line_no,
                FormatIssue::MalformedLine(String::new()),
            ));
        }

        let mut tokens = line.split(' ');
        let (directory, count) = match (tokens.next(), tokens.next()) {
            (Some(directory), Some(count)) if !directory.is_empty() => (directory, count),
            _ => {
                return Err(DriftError::format(
                    self.line_no,
                    FormatIssue::MalformedLine(line.clone()),
                ))
            }
        };
        let declared = self.parse_number::<usize>(count)?;
        let directory = directory.to_string();

        let mut files = Vec::with_capacity(declared.min(4096));
        loop {
            match self.next_line()? {
                None => {
                    if files.len() == declared {
                        // entries complete, separator missing
                        return Err(DriftError::format(self.line_no + 1, FormatIssue::Truncated));
                    }
                    return Err(DriftError::format(
                        self.line_no + 1,
                        FormatIssue::CountMismatch {
                            directory,
                            declared,
                            actual: files.len(),
                        },
                    ));
                }
                Some(line) if line.is_empty() => {
                    if files.len() != declared {
                        return Err(DriftError::format(
                            self.line_no,
                            FormatIssue::CountMismatch {
                                directory,
                                declared,
                                actual: files.len(),
                            },
                        ));
                    }
                    return Ok(Some(DirectoryEntry { directory, files }));
                }
                Some(line) => {
                    if files.len() == declared {
                        return Err(DriftError::format(
                            self.line_no,
                            FormatIssue::CountMismatch {
                                directory,
                                declared,
                                actual: declared + 1,
                            },
                        ));
                    }
                    files.push(self.parse_file_entry(&line)?);
                }
            }
        }
    }

    fn parse_file_entry(&self, line: &str) -> Result<FileEntry> {
        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens.len() < 4 || tokens[..4].iter().any(|t| t.is_empty()) {
            return Err(DriftError::format(
                self.line_no,
                FormatIssue::MalformedLine(line.to_string()),
            ));
        }
        let new_digest = self.parse_digest(tokens[0])?;
        let old_digest = self.parse_digest(tokens[1])?;
        let file = tokens[2].to_string();
        let kind = ChangeKind::from_code(tokens[3]).ok_or_else(|| {
            DriftError::format(
                self.line_no,
                FormatIssue::UnknownChangeCode(tokens[3].to_string()),
            )
        })?;

        let entry = FileEntry {
            file,
            kind,
            new_digest,
            old_digest,
        };
        if !entry.is_consistent() {
            return Err(DriftError::format(
                self.line_no,
                FormatIssue::InvalidEntry {
                    file: entry.file,
                    kind: format!("{kind:?}"),
                },
            ));
        }
        Ok(entry)
    }

    fn parse_digest(&self, token: &str) -> Result<Option<Digest>> {
        if token == ABSENT_DIGEST {
            return Ok(None);
        }
        Digest::from_hex(token).map(Some).ok_or_else(|| {
            DriftError::format(self.line_no, FormatIssue::InvalidDigest(token.to_string()))
        })
    }

    fn parse_number<T: std::str::FromStr>(&self, token: &str) -> Result<T> {
        token.parse::<T>().map_err(|_| {
            DriftError::format(self.line_no, FormatIssue::InvalidNumber(token.to_string()))
        })
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}
