//! 单例文件锁
//!
//! 同一个 socket 池只能由一个守护进程持有：第二个实例在绑定之前就会失败，
//! 而不是把前一个实例的 socket 文件删掉。

use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct SingletonLock {
    file: File,
    path: PathBuf,
}

impl SingletonLock {
    /// 尝试获取锁（非阻塞），成功后写入当前 PID
    ///
    /// 锁已被其他进程持有时返回 `AlreadyExists`。
    pub fn try_lock(lock_path: impl AsRef<Path>) -> io::Result<Self> {
        let path = lock_path.as_ref();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }

        // 拿到锁之前不能截断：文件里可能是正在运行的实例的 PID
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        if !file.try_lock_exclusive()? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is locked by another saftbusd", path.display()),
            ));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(&file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// 默认锁文件：与 socket 同目录，`<base>.lock`
pub fn default_lock_file(socket_base: &Path) -> PathBuf {
    let mut name = socket_base.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lock_writes_pid_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("run").join("saftbus.lock");

        let lock = SingletonLock::try_lock(&lock_path).unwrap();
        assert_eq!(lock.path(), lock_path);
        drop(lock);

        let content = fs::read_to_string(&lock_path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        // 释放后可以再次获取
        let again = SingletonLock::try_lock(&lock_path).unwrap();
        drop(again);
    }

    #[test]
    fn test_second_handle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("saftbus.lock");
        let _held = SingletonLock::try_lock(&lock_path).unwrap();

        // flock 按打开的文件描述跟踪，同进程的第二次打开同样会被拒绝
        let err = SingletonLock::try_lock(&lock_path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_default_lock_file() {
        assert_eq!(
            default_lock_file(Path::new("/var/run/saftbus/saftbus")),
            PathBuf::from("/var/run/saftbus/saftbus.lock")
        );
    }
}
