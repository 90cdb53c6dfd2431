// ─── Step primitives ───
// Blocking filesystem operations behind the recipe steps. The interpreter
// runs them on the blocking pool; each one runs to completion.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use super::recipe::ArchiveFormat;
use crate::core::error::{EngineError, EngineResult};

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> EngineError + '_ {
    move |source| EngineError::io(path, source)
}

// ── Extract ─────────────────────────────────────────────

/// Unpack `archive` into `dest`, dropping `strip` leading components from
/// every entry. Returns the number of files written.
pub fn extract_archive(
    archive: &Path,
    dest: &Path,
    format: ArchiveFormat,
    strip: usize,
) -> EngineResult<u64> {
    std::fs::create_dir_all(dest).map_err(io_err(dest))?;
    let file = File::open(archive).map_err(io_err(archive))?;
    let written = match format {
        ArchiveFormat::Zip => extract_zip(file, dest, strip)?,
        ArchiveFormat::Tar => {
            extract_tar(tar::Archive::new(BufReader::new(file)), archive, dest, strip)?
        }
        ArchiveFormat::TarGz => extract_tar(
            tar::Archive::new(GzDecoder::new(BufReader::new(file))),
            archive,
            dest,
            strip,
        )?,
    };
    info!("Extracted {} files from {:?} into {:?}", written, archive, dest);
    Ok(written)
}

/// Relative output path for an archive entry, or `None` when nothing is
/// left after stripping. Entries with `..` or absolute parts are rejected.
fn entry_relative_path(raw: &Path, strip: usize) -> EngineResult<Option<PathBuf>> {
    let mut rel = PathBuf::new();
    for component in raw.components().skip(strip) {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            _ => {
                return Err(EngineError::Other(format!(
                    "Archive entry escapes destination: {}",
                    raw.display()
                )))
            }
        }
    }
    Ok(if rel.as_os_str().is_empty() { None } else { Some(rel) })
}

fn extract_zip(file: File, dest: &Path, strip: usize) -> EngineResult<u64> {
    let mut archive = zip::ZipArchive::new(file)?;
    let mut written = 0;

    for index in 0..archive.len() {
        let mut zipped = archive.by_index(index)?;
        let enclosed = zipped
            .enclosed_name()
            .ok_or_else(|| EngineError::Other(format!("Invalid zip entry path: {}", zipped.name())))?;
        let Some(rel_path) = entry_relative_path(&enclosed, strip)? else {
            continue;
        };

        let out_path = dest.join(rel_path);
        if zipped.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(io_err(&out_path))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let mut out = File::create(&out_path).map_err(io_err(&out_path))?;
        std::io::copy(&mut zipped, &mut out).map_err(io_err(&out_path))?;

        if let Some(mode) = zipped.unix_mode() {
            apply_mode(&out_path, mode)?;
        }
        written += 1;
    }
    Ok(written)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> EngineResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
        .map_err(io_err(path))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> EngineResult<()> {
    Ok(())
}

fn extract_tar<R: std::io::Read>(
    mut archive: tar::Archive<R>,
    archive_path: &Path,
    dest: &Path,
    strip: usize,
) -> EngineResult<u64> {
    let root = std::fs::canonicalize(dest).map_err(io_err(dest))?;
    let mut written = 0;
    let entries = archive.entries().map_err(io_err(archive_path))?;
    for entry in entries {
        let mut entry = entry.map_err(io_err(archive_path))?;
        let raw = entry.path().map_err(io_err(archive_path))?.into_owned();
        let Some(rel_path) = entry_relative_path(&raw, strip)? else {
            continue;
        };
        let out_path = root.join(&rel_path);
        ensure_no_escaping_link(&root, &rel_path)?;

        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            let target = entry
                .link_name()
                .map_err(io_err(archive_path))?
                .map(|t| t.into_owned());
            let Some(target) = target else {
                continue;
            };
            if kind.is_symlink() {
                if !symlink_stays_inside(&rel_path, &target) {
                    warn!("Skipping link {:?} -> {:?}: points outside the destination", raw, target);
                    continue;
                }
                make_parent(&out_path)?;
                make_symlink(&target, &out_path)?;
            } else {
                let Some(rel_target) = entry_relative_path(&target, strip).ok().flatten() else {
                    warn!("Skipping hard link {:?} -> {:?}: points outside the destination", raw, target);
                    continue;
                };
                ensure_no_escaping_link(&root, &rel_target)?;
                make_parent(&out_path)?;
                let source = root.join(rel_target);
                std::fs::hard_link(&source, &out_path).map_err(io_err(&out_path))?;
                written += 1;
            }
            continue;
        }

        make_parent(&out_path)?;
        entry.unpack(&out_path).map_err(io_err(&out_path))?;
        if kind.is_file() {
            written += 1;
        }
    }
    Ok(written)
}

fn make_parent(path: &Path) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    Ok(())
}

/// Every existing ancestor of `rel` under `root` must resolve inside `root`.
fn ensure_no_escaping_link(root: &Path, rel: &Path) -> EngineResult<()> {
    let mut current = root.to_path_buf();
    let parents: Vec<_> = rel.components().collect();
    for part in parents.iter().take(parents.len().saturating_sub(1)) {
        current.push(part);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let resolved = std::fs::canonicalize(&current).map_err(io_err(&current))?;
                if !resolved.starts_with(root) {
                    return Err(EngineError::Other(format!(
                        "Archive entry escapes destination through {}",
                        current.display()
                    )));
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(EngineError::io(&current, e)),
        }
    }
    Ok(())
}

/// Resolve a symlink target lexically from the link's own directory.
fn symlink_stays_inside(link_rel: &Path, target: &Path) -> bool {
    let mut depth: Vec<&std::ffi::OsStr> = link_rel
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    for component in target.components() {
        match component {
            Component::Normal(part) => depth.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth.pop().is_none() {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> EngineResult<()> {
    std::os::unix::fs::symlink(target, link).map_err(io_err(link))
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, link: &Path) -> EngineResult<()> {
    let source = link.parent().map(|p| p.join(target)).unwrap_or_else(|| target.to_path_buf());
    std::fs::copy(&source, link).map(|_| ()).map_err(io_err(link))
}

// ── Move ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    Copied,
    /// Optional source was absent.
    SkippedMissing,
    /// Destination file already exists; it is never overwritten.
    SkippedExisting,
}

/// Move `src` to `dest`. When `dest` is an existing directory the source is
/// placed inside it. With `copy` set the source is left in place (used for
/// files owned by the asset cache).
pub fn move_path(src: &Path, dest: &Path, optional: bool, copy: bool) -> EngineResult<MoveOutcome> {
    if !src.exists() {
        if optional {
            info!("Optional path {:?} not present", src);
            return Ok(MoveOutcome::SkippedMissing);
        }
        return Err(EngineError::Other(format!(
            "Invalid source for move: {}",
            src.display()
        )));
    }

    let target = if dest.is_dir() {
        match src.file_name() {
            Some(name) => dest.join(name),
            None => dest.to_path_buf(),
        }
    } else {
        dest.to_path_buf()
    };
    if target == src {
        debug!("Source and destination are the same, skipping");
        return Ok(MoveOutcome::SkippedExisting);
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    if src.is_file() {
        if target.exists() {
            info!("Destination {:?} exists, skipping", target);
            return Ok(MoveOutcome::SkippedExisting);
        }
        if copy {
            std::fs::copy(src, &target).map_err(io_err(&target))?;
            return Ok(MoveOutcome::Copied);
        }
        if std::fs::rename(src, &target).is_err() {
            std::fs::copy(src, &target).map_err(io_err(&target))?;
            std::fs::remove_file(src).map_err(io_err(src))?;
        }
        return Ok(MoveOutcome::Moved);
    }

    if !target.exists() && !copy && std::fs::rename(src, &target).is_ok() {
        return Ok(MoveOutcome::Moved);
    }
    merge_dirs(src, &target, false)?;
    if copy {
        Ok(MoveOutcome::Copied)
    } else {
        std::fs::remove_dir_all(src).map_err(io_err(src))?;
        Ok(MoveOutcome::Moved)
    }
}

/// Copy the tree at `src` into `dest`. Existing files are replaced only
/// with `overwrite`.
fn merge_dirs(src: &Path, dest: &Path, overwrite: bool) -> EngineResult<()> {
    std::fs::create_dir_all(dest).map_err(io_err(dest))?;
    for entry in std::fs::read_dir(src).map_err(io_err(src))? {
        let entry = entry.map_err(io_err(src))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            merge_dirs(&from, &to, overwrite)?;
        } else if overwrite || !to.exists() {
            std::fs::copy(&from, &to).map_err(io_err(&to))?;
        } else {
            debug!("Keeping existing {:?}", to);
        }
    }
    Ok(())
}

// ── Copy / rename / chmodx ──────────────────────────────

/// Copy `src` into the directory `dest_dir`, merging directory trees and
/// replacing files of the same name. Returns where a single file landed,
/// `None` for directories and for an absent optional source.
pub fn copy_into(src: &Path, dest_dir: &Path, optional: bool) -> EngineResult<Option<PathBuf>> {
    if !src.exists() {
        if optional {
            info!("Optional path {:?} not present", src);
            return Ok(None);
        }
        return Err(EngineError::Other(format!(
            "Source does not exist: {}",
            src.display()
        )));
    }
    std::fs::create_dir_all(dest_dir).map_err(io_err(dest_dir))?;

    if src.is_dir() {
        merge_dirs(src, dest_dir, true)?;
        return Ok(None);
    }
    let Some(name) = src.file_name() else {
        return Err(EngineError::Other(format!("Cannot copy {}", src.display())));
    };
    let target = dest_dir.join(name);
    if target != src {
        std::fs::copy(src, &target).map_err(io_err(&target))?;
    }
    Ok(Some(target))
}

/// Rename `src` to exactly `dest`. An empty directory at `dest` is replaced;
/// anything else there is an error. A rename that already happened (source
/// gone, destination present) is accepted.
pub fn rename_path(src: &Path, dest: &Path) -> EngineResult<()> {
    if !src.exists() {
        if dest.exists() {
            info!("{:?} already renamed to {:?}", src, dest);
            return Ok(());
        }
        return Err(EngineError::Other(format!(
            "Rename error, source path does not exist: {}",
            src.display()
        )));
    }
    if dest.is_dir() {
        let _ = std::fs::remove_dir(dest);
    }
    if dest.exists() {
        return Err(EngineError::Other(format!(
            "Rename error, destination already exists: {}",
            dest.display()
        )));
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    if std::fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    if src.is_dir() {
        merge_dirs(src, dest, false)?;
        std::fs::remove_dir_all(src).map_err(io_err(src))
    } else {
        std::fs::copy(src, dest).map_err(io_err(dest))?;
        std::fs::remove_file(src).map_err(io_err(src))
    }
}

/// Add the executable bits wherever the read bits are set.
#[cfg(unix)]
pub fn make_executable(path: &Path) -> EngineResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = std::fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EngineError::Other(format!(
                "Invalid file '{}'. Can't make it executable",
                path.display()
            ))
        } else {
            EngineError::io(path, e)
        }
    })?;
    let mode = meta.permissions().mode();
    let exec = (mode & 0o444) >> 2;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode | exec | 0o100))
        .map_err(io_err(path))
}

#[cfg(not(unix))]
pub fn make_executable(path: &Path) -> EngineResult<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(EngineError::Other(format!(
            "Invalid file '{}'. Can't make it executable",
            path.display()
        )))
    }
}

// ── Config merge ────────────────────────────────────────

/// Set `key` under `[section]` in an INI file, keeping every other line.
pub fn merge_ini(path: &Path, section: &str, key: &str, value: &str) -> EngineResult<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(EngineError::io(path, e)),
    };
    let merged = set_ini_value(&existing, section, key, value);
    write_text(path, &merged)
}

fn set_ini_value(text: &str, section: &str, key: &str, value: &str) -> String {
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let new_line = format!("{key}={value}");

    let section_header = |line: &str| -> Option<String> {
        let trimmed = line.trim();
        trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .map(|s| s.trim().to_string())
    };

    let mut in_section = section.is_empty();
    let mut section_end: Option<usize> = if in_section { Some(0) } else { None };
    for (i, line) in lines.iter().enumerate() {
        if let Some(name) = section_header(line) {
            if in_section {
                break;
            }
            in_section = name == section;
            if in_section {
                section_end = Some(i + 1);
            }
            continue;
        }
        if !in_section {
            continue;
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with(';') && !trimmed.starts_with('#') {
            section_end = Some(i + 1);
        }
        let existing_key = trimmed.split_once('=').map(|(k, _)| k.trim());
        if existing_key == Some(key) {
            lines[i] = new_line;
            return join_lines(lines);
        }
    }

    match section_end {
        Some(at) => lines.insert(at, new_line),
        None => {
            if lines.last().map(|l| !l.trim().is_empty()).unwrap_or(false) {
                lines.push(String::new());
            }
            lines.push(format!("[{section}]"));
            lines.push(new_line);
        }
    }
    join_lines(lines)
}

fn join_lines(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Set a dotted `key` in a JSON document, creating objects on the way.
pub fn merge_json(path: &Path, key: &str, value: serde_json::Value) -> EngineResult<()> {
    let mut doc = match std::fs::read(path) {
        Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
        Ok(_) => serde_json::Value::Object(Default::default()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            serde_json::Value::Object(Default::default())
        }
        Err(e) => return Err(EngineError::io(path, e)),
    };

    let mut cursor = &mut doc;
    for part in key.split('.') {
        if !cursor.is_object() {
            *cursor = serde_json::Value::Object(Default::default());
        }
        let Some(map) = cursor.as_object_mut() else {
            return Err(EngineError::Other(format!("cannot set '{key}' in {}", path.display())));
        };
        cursor = map
            .entry(part.to_string())
            .or_insert(serde_json::Value::Null);
    }
    *cursor = value;

    write_text(path, &serde_json::to_string_pretty(&doc)?)
}

// ── Plain files ─────────────────────────────────────────

pub fn write_file(path: &Path, content: &str, append: bool) -> EngineResult<()> {
    if append {
        use std::io::Write;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err(path))?;
        file.write_all(content.as_bytes()).map_err(io_err(path))
    } else {
        write_text(path, content)
    }
}

fn write_text(path: &Path, content: &str) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    std::fs::write(path, content).map_err(io_err(path))
}

// ── Execute ─────────────────────────────────────────────

pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub accepted_codes: Vec<i32>,
}

/// Run a command to completion and check its exit status.
pub async fn run_command(spec: &CommandSpec) -> EngineResult<i32> {
    info!("Executing {:?} {:?}", spec.program, spec.args);
    let output = tokio::process::Command::new(&spec.program)
        .args(&spec.args)
        .envs(&spec.env)
        .current_dir(&spec.working_dir)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(io_err(&spec.program))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!(target: "waystone::installer::exec", "{}", line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        debug!(target: "waystone::installer::exec", "stderr: {}", line);
    }

    match output.status.code() {
        Some(code) if spec.accepted_codes.contains(&code) => Ok(code),
        code => Err(EngineError::CommandFailed {
            command: spec.program.display().to_string(),
            code,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn build_tgz(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn zip_extraction_with_strip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("game.zip");
        build_zip(
            &archive,
            &[("Quake/id1/pak0.pak", b"pak"), ("Quake/readme.txt", b"hi")],
        );
        let dest = dir.path().join("out");

        let n = extract_archive(&archive, &dest, ArchiveFormat::Zip, 1).unwrap();
        assert_eq!(n, 2);
        assert_eq!(std::fs::read(dest.join("id1/pak0.pak")).unwrap(), b"pak");
        assert!(dest.join("readme.txt").is_file());
    }

    #[test]
    fn tarball_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("runtime.tar.gz");
        build_tgz(&archive, &[("wine/bin/wine", b"#!/bin/sh\n")]);
        let dest = dir.path().join("out");

        extract_archive(&archive, &dest, ArchiveFormat::TarGz, 0).unwrap();
        assert!(dest.join("wine/bin/wine").is_file());
    }

    #[cfg(unix)]
    fn build_tar_with_link(path: &Path, link: &str, target: &Path, then: &str) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, link, target).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, then, &b"evil"[..]).unwrap();
        builder.finish().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn tar_link_out_of_destination_is_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        let archive = dir.path().join("evil.tar");
        build_tar_with_link(&archive, "link", &outside, "link/evil.txt");
        let dest = dir.path().join("out");

        extract_archive(&archive, &dest, ArchiveFormat::Tar, 0).unwrap();
        assert!(!outside.join("evil.txt").exists());
        assert!(!dest.join("link").is_symlink());
        assert_eq!(std::fs::read(dest.join("link/evil.txt")).unwrap(), b"evil");
    }

    #[cfg(unix)]
    #[test]
    fn existing_link_out_of_destination_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        let dest = dir.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        std::os::unix::fs::symlink(&outside, dest.join("saves")).unwrap();
        let archive = dir.path().join("game.tar.gz");
        build_tgz(&archive, &[("saves/slot1.sav", b"sav")]);

        assert!(extract_archive(&archive, &dest, ArchiveFormat::TarGz, 0).is_err());
        assert!(!outside.join("slot1.sav").exists());
    }

    #[cfg(unix)]
    #[test]
    fn tar_link_inside_destination_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("runtime.tar");
        build_tar_with_link(&archive, "wine/bin/wine64", Path::new("wine"), "wine/bin/wine");
        let dest = dir.path().join("out");

        extract_archive(&archive, &dest, ArchiveFormat::Tar, 0).unwrap();
        assert!(dest.join("wine/bin/wine64").is_symlink());
        assert_eq!(std::fs::read(dest.join("wine/bin/wine64")).unwrap(), b"evil");
    }

    #[test]
    fn symlink_targets_are_resolved_from_the_link() {
        assert!(symlink_stays_inside(Path::new("a/b/link"), Path::new("../c")));
        assert!(!symlink_stays_inside(Path::new("a/link"), Path::new("../../c")));
        assert!(!symlink_stays_inside(Path::new("link"), Path::new("/etc")));
    }

    #[test]
    fn entry_paths_cannot_escape() {
        assert!(entry_relative_path(Path::new("../evil"), 0).is_err());
        assert_eq!(entry_relative_path(Path::new("top/"), 1).unwrap(), None);
        assert_eq!(
            entry_relative_path(Path::new("top/a/b"), 1).unwrap(),
            Some(PathBuf::from("a/b"))
        );
    }

    #[test]
    fn move_never_overwrites_and_honours_optional() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dest_dir = dir.path().join("dest");
        std::fs::create_dir_all(&dest_dir).unwrap();
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(dest_dir.join("a.txt"), b"old").unwrap();

        assert_eq!(
            move_path(&src, &dest_dir, false, false).unwrap(),
            MoveOutcome::SkippedExisting
        );
        assert_eq!(std::fs::read(dest_dir.join("a.txt")).unwrap(), b"old");

        assert_eq!(
            move_path(&dir.path().join("missing"), &dest_dir, true, false).unwrap(),
            MoveOutcome::SkippedMissing
        );
        assert!(move_path(&dir.path().join("missing"), &dest_dir, false, false).is_err());
    }

    #[test]
    fn move_directory_into_existing_merges() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("id1");
        std::fs::create_dir_all(src.join("maps")).unwrap();
        std::fs::write(src.join("maps/e1m1.bsp"), b"map").unwrap();
        std::fs::write(src.join("config.cfg"), b"new").unwrap();
        let target = dir.path().join("game/id1");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("config.cfg"), b"user").unwrap();

        let outcome = move_path(&src, &dir.path().join("game"), false, false).unwrap();
        assert_eq!(outcome, MoveOutcome::Moved);
        assert!(!src.exists());
        assert_eq!(std::fs::read(target.join("config.cfg")).unwrap(), b"user");
        assert!(target.join("maps/e1m1.bsp").is_file());
    }

    #[test]
    fn copy_mode_leaves_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("setup.exe");
        std::fs::write(&src, b"mz").unwrap();
        let outcome = move_path(&src, &dir.path().join("game/setup.exe"), false, true).unwrap();
        assert_eq!(outcome, MoveOutcome::Copied);
        assert!(src.exists());
    }

    #[test]
    fn copy_merges_trees_and_replaces_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("patch");
        std::fs::create_dir_all(src.join("id1")).unwrap();
        std::fs::write(src.join("id1/pak0.pak"), b"patched").unwrap();
        let dest = dir.path().join("game");
        std::fs::create_dir_all(dest.join("id1")).unwrap();
        std::fs::write(dest.join("id1/pak0.pak"), b"old").unwrap();
        std::fs::write(dest.join("id1/pak1.pak"), b"keep").unwrap();

        assert_eq!(copy_into(&src, &dest, false).unwrap(), None);
        assert!(src.join("id1/pak0.pak").exists());
        assert_eq!(std::fs::read(dest.join("id1/pak0.pak")).unwrap(), b"patched");
        assert_eq!(std::fs::read(dest.join("id1/pak1.pak")).unwrap(), b"keep");

        let file = dir.path().join("setup.sh");
        std::fs::write(&file, b"#!/bin/sh\n").unwrap();
        let placed = copy_into(&file, &dest.join("bin"), false).unwrap();
        assert_eq!(placed, Some(dest.join("bin/setup.sh")));
        assert!(copy_into(&dir.path().join("nope"), &dest, true).unwrap().is_none());
        assert!(copy_into(&dir.path().join("nope"), &dest, false).is_err());
    }

    #[test]
    fn rename_refuses_to_clobber_and_accepts_replay() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("GAME.EXE");
        std::fs::write(&src, b"mz").unwrap();
        let dest = dir.path().join("sub/game.exe");
        std::fs::create_dir_all(&dest).unwrap();

        rename_path(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"mz");
        rename_path(&src, &dest).unwrap();

        let other = dir.path().join("other.exe");
        std::fs::write(&other, b"x").unwrap();
        assert!(rename_path(&other, &dest).is_err());
        assert!(rename_path(&dir.path().join("missing"), &dir.path().join("nowhere")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn chmodx_sets_exec_bits() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("setup.sh");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        make_executable(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
        assert!(make_executable(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn ini_merge_keeps_unrelated_lines() {
        let text = "; settings\n[video]\nwidth=640\n\n[audio]\nvolume=3\n";
        let merged = set_ini_value(text, "video", "fullscreen", "true");
        assert_eq!(
            merged,
            "; settings\n[video]\nwidth=640\nfullscreen=true\n\n[audio]\nvolume=3\n"
        );

        let replaced = set_ini_value(&merged, "audio", "volume", "7");
        assert!(replaced.contains("volume=7"));
        assert!(!replaced.contains("volume=3"));

        let added = set_ini_value("[a]\nx=1\n", "b", "y", "2");
        assert_eq!(added, "[a]\nx=1\n\n[b]\ny=2\n");
    }

    #[test]
    fn json_merge_creates_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"audio": {"volume": 3}, "name": "q"}"#).unwrap();

        merge_json(&path, "video.fullscreen", serde_json::json!(true)).unwrap();
        merge_json(&path, "audio.volume", serde_json::json!(7)).unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["video"]["fullscreen"], serde_json::json!(true));
        assert_eq!(doc["audio"]["volume"], serde_json::json!(7));
        assert_eq!(doc["name"], serde_json::json!("q"));
    }

    #[test]
    fn write_file_appends_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/autoexec.cfg");
        write_file(&path, "a\n", false).unwrap();
        write_file(&path, "b\n", true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_exit_codes_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let spec = |code: &str, accepted: Vec<i32>| CommandSpec {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), format!("exit {code}")],
            env: BTreeMap::new(),
            working_dir: dir.path().to_path_buf(),
            accepted_codes: accepted,
        };

        assert_eq!(run_command(&spec("0", vec![0])).await.unwrap(), 0);
        assert_eq!(run_command(&spec("3", vec![0, 3])).await.unwrap(), 3);
        let err = run_command(&spec("2", vec![0])).await.unwrap_err();
        assert!(matches!(err, EngineError::CommandFailed { code: Some(2), .. }));
    }
}
