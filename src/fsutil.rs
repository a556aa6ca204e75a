use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 이동/복사 대상이 기존 디렉토리(또는 `/`로 끝남)면 원본 파일 이름을 붙임
pub fn resolve_destination(source: &Path, destination: &Path) -> PathBuf {
    let as_dir = destination.is_dir()
        || destination
            .to_str()
            .map(|s| s.ends_with('/') || s.ends_with(std::path::MAIN_SEPARATOR))
            .unwrap_or(false);

    match (as_dir, source.file_name()) {
        (true, Some(name)) => destination.join(name),
        _ => destination.to_path_buf(),
    }
}

/// 상대 경로를 현재 디렉토리 기준 절대 경로로 변환 (심볼릭 링크는 따라가지 않음)
pub fn absolute_path(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// 임시 파일에 쓰고 fsync 후 rename (같은 디렉토리 안에서 원자적)
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            create_private_dir(parent)?;
        }
    }

    let tmp_path = tmp_sibling(path);
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }

    let mut tmp_file = opts.open(&tmp_path)?;
    tmp_file.write_all(contents)?;
    tmp_file.sync_all()?;
    drop(tmp_file);

    fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

/// 파일 또는 디렉토리 트리를 복사 (심볼릭 링크는 링크로 재생성). 복사한 바이트 수 반환
pub fn copy_tree(source: &Path, dest: &Path) -> io::Result<u64> {
    let mut copied = 0;
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(source).unwrap_or(Path::new(""));
        let target = if relative.as_os_str().is_empty() {
            dest.to_path_buf()
        } else {
            dest.join(relative)
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            copied += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

/// 경로 전체 크기 (디렉토리는 하위 파일 합계)
pub fn tree_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

/// 0700 권한으로 디렉토리 생성
pub fn create_private_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

/// 짧게 유지되는 배타적 파일 잠금. drop 시 해제됩니다.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// `wait` 안에 잠금을 얻지 못하면 `WouldBlock`
    pub fn acquire_within(path: &Path, wait: Duration) -> io::Result<Self> {
        let file = open_lock_file(path)?;
        let deadline = Instant::now() + wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || is_contended(&e) => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::WouldBlock,
                            format!("{} is locked by another writer", path.display()),
                        ));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            create_private_dir(parent)?;
        }
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
}

fn is_contended(e: &io::Error) -> bool {
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// 권한 비트 (unix 외에서는 0)
pub fn mode_of(metadata: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0
    }
}

pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_destination_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let docs = dir.path().join("Documents");
        fs::create_dir(&docs).unwrap();

        assert_eq!(
            resolve_destination(Path::new("a.txt"), &docs),
            docs.join("a.txt")
        );
        assert_eq!(
            resolve_destination(Path::new("a.txt"), Path::new("new/")),
            Path::new("new/a.txt")
        );
        assert_eq!(
            resolve_destination(Path::new("a.txt"), Path::new("b.txt")),
            Path::new("b.txt")
        );
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("state.json");

        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"two");
        // 임시 파일이 남지 않아야 함
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_copy_tree_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), b"abc").unwrap();
        fs::write(src.join("nested/b.txt"), b"defg").unwrap();

        let dest = dir.path().join("copy");
        assert_eq!(copy_tree(&src, &dest).unwrap(), 7);
        assert_eq!(fs::read(dest.join("nested/b.txt")).unwrap(), b"defg");
        assert_eq!(tree_size(&dest), 7);
    }

    #[test]
    fn test_lock_is_reacquirable_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".lock");
        {
            let _lock = FileLock::acquire(&lock_path).unwrap();
        }
        let lock = FileLock::acquire(&lock_path).unwrap();
        assert_eq!(lock.path(), lock_path.as_path());
    }

    #[test]
    fn test_acquire_within_gives_up_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".lock");
        let held = FileLock::acquire(&lock_path).unwrap();

        let started = Instant::now();
        let err = FileLock::acquire_within(&lock_path, Duration::from_millis(100))
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(started.elapsed() < Duration::from_secs(2));

        drop(held);
        assert!(FileLock::acquire_within(&lock_path, Duration::from_millis(100)).is_ok());
    }
}
