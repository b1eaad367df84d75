// 文件读写
// 本地路径直接走文件系统，会话路径走该会话的 SFTP 子系统

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result};
use crate::models::settings::FileSettings;
use crate::models::{Owner, ReadRange, WriteMode};
use crate::ssh::channel::RemoteChannel;
use crate::ssh::registry::SessionRegistry;

/// 文件传输
pub struct FileTransfer {
    registry: Arc<SessionRegistry>,
    /// 本地路径的根目录
    local_root: Option<PathBuf>,
    create_parents: bool,
}

impl FileTransfer {
    pub fn new(registry: Arc<SessionRegistry>, settings: &FileSettings) -> Self {
        Self {
            registry,
            local_root: settings.local_root.clone(),
            create_parents: settings.create_parents,
        }
    }

    /// 读取文件（可只取开头或结尾 N 字节）
    pub async fn read(&self, owner: &Owner, path: &str, range: ReadRange) -> Result<Vec<u8>> {
        match owner {
            Owner::Local => {
                let local = self.resolve_local(path)?;
                debug!("[Transfer] Reading local file {:?}", local);
                let data = tokio::fs::read(&local)
                    .await
                    .map_err(|e| BrokerError::from_io(path, e))?;
                Ok(range.apply(data))
            }
            Owner::Session(session_id) => {
                let session = self.registry.get(session_id)?;
                let channel = session.channel()?;
                session.touch();
                let result = channel.read_file(path, range).await;
                self.check_transport(session_id, channel.as_ref(), result).await
            }
        }
    }

    /// 写入文件
    /// 本地覆盖写先写入同目录临时文件再重命名
    pub async fn write(&self, owner: &Owner, path: &str, data: &[u8], mode: WriteMode) -> Result<()> {
        match owner {
            Owner::Local => {
                let local = self.resolve_local(path)?;
                self.write_local(path, &local, data, mode).await?;
            }
            Owner::Session(session_id) => {
                let session = self.registry.get(session_id)?;
                let channel = session.channel()?;
                session.touch();
                let result = channel.write_file(path, data, mode).await;
                self.check_transport(session_id, channel.as_ref(), result).await?;
            }
        }
        info!(
            "[Transfer] Wrote {} bytes to {}:{} ({:?})",
            data.len(),
            owner,
            path,
            mode
        );
        Ok(())
    }

    /// 连接层故障时将会话标记为 FAILED；文件本身的错误（不存在、无权限）不影响会话
    async fn check_transport<T>(
        &self,
        session_id: &str,
        channel: &dyn RemoteChannel,
        result: Result<T>,
    ) -> Result<T> {
        let reason = match &result {
            Err(e @ BrokerError::Unreachable(_)) => Some(e.to_string()),
            Err(e @ BrokerError::Transfer(_)) if channel.is_closed() => Some(e.to_string()),
            _ => None,
        };
        if let Some(reason) = reason {
            warn!("[Transfer] Transport failure on session {}: {}", session_id, reason);
            if let Err(err) = self.registry.mark_failed(session_id, &reason).await {
                debug!("[Transfer] Could not mark session {} failed: {}", session_id, err);
            }
        }
        result
    }

    /// 解析本地路径；设置了根目录时绝对路径也重定位到根目录下，且不允许 ..
    fn resolve_local(&self, path: &str) -> Result<PathBuf> {
        if path.trim().is_empty() {
            return Err(BrokerError::Config("path must not be empty".to_string()));
        }
        let Some(root) = &self.local_root else {
            return Ok(PathBuf::from(path));
        };

        let mut resolved = root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    return Err(BrokerError::Permission(format!(
                        "{}: path escapes {:?}",
                        path, root
                    )));
                }
            }
        }
        Ok(resolved)
    }

    /// 符号链接解析后的路径仍须位于根目录下
    async fn ensure_within_root(&self, display: &str, target: &Path) -> Result<()> {
        let Some(root) = &self.local_root else {
            return Ok(());
        };
        let root = tokio::fs::canonicalize(root)
            .await
            .unwrap_or_else(|_| root.clone());
        if !target.starts_with(&root) {
            return Err(BrokerError::Permission(format!(
                "{}: path escapes {:?}",
                display, root
            )));
        }
        Ok(())
    }

    async fn write_local(&self, display: &str, path: &Path, data: &[u8], mode: WriteMode) -> Result<()> {
        if self.create_parents {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BrokerError::from_io(display, e))?;
            }
        }

        match mode {
            WriteMode::Overwrite => {
                // 符号链接写到其指向的文件，已有文件保留权限
                let target = match tokio::fs::canonicalize(path).await {
                    Ok(real) => {
                        self.ensure_within_root(display, &real).await?;
                        real
                    }
                    Err(_) => path.to_path_buf(),
                };
                let permissions = tokio::fs::metadata(&target)
                    .await
                    .ok()
                    .map(|meta| meta.permissions());
                let temp = temp_sibling(&target);
                if let Err(e) = replace_file(&temp, &target, data, permissions).await {
                    let _ = tokio::fs::remove_file(&temp).await;
                    return Err(BrokerError::from_io(display, e));
                }
            }
            WriteMode::Append => {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| BrokerError::from_io(display, e))?;
                file.write_all(data)
                    .await
                    .map_err(|e| BrokerError::from_io(display, e))?;
                file.flush()
                    .await
                    .map_err(|e| BrokerError::from_io(display, e))?;
            }
        }
        Ok(())
    }
}

/// 写入临时文件后重命名到目标位置
async fn replace_file(
    temp: &Path,
    target: &Path,
    data: &[u8],
    permissions: Option<std::fs::Permissions>,
) -> std::io::Result<()> {
    tokio::fs::write(temp, data).await?;
    if let Some(permissions) = permissions {
        tokio::fs::set_permissions(temp, permissions).await?;
    }
    tokio::fs::rename(temp, target).await
}

/// 同目录下的临时文件名（保证 rename 不跨文件系统）
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::settings::TrackerSettings;
    use crate::services::tracker::OutputTracker;
    use crate::ssh::config::{AuthMethod, TargetDescriptor};
    use crate::ssh::session::SessionState;
    use crate::testing::{FakeConnector, CONNECTION_RESET, PASSWORD};

    fn target() -> TargetDescriptor {
        TargetDescriptor::with_default_port("web1", "deploy", AuthMethod::Password(PASSWORD.into()))
            .unwrap()
    }

    fn setup(settings: &FileSettings) -> (Arc<FakeConnector>, Arc<SessionRegistry>, FileTransfer) {
        let connector = Arc::new(FakeConnector::new());
        let tracker = Arc::new(OutputTracker::new(&TrackerSettings::default()));
        let registry = Arc::new(SessionRegistry::new(connector.clone(), tracker));
        let transfer = FileTransfer::new(registry.clone(), settings);
        (connector, registry, transfer)
    }

    #[tokio::test]
    async fn test_local_round_trip_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, transfer) = setup(&FileSettings::default());
        let path = dir.path().join("nested/dir/notes.txt");
        let path = path.to_str().unwrap();

        transfer
            .write(&Owner::Local, path, b"hello", WriteMode::Overwrite)
            .await
            .unwrap();
        transfer
            .write(&Owner::Local, path, b" world", WriteMode::Append)
            .await
            .unwrap();
        assert_eq!(
            transfer.read(&Owner::Local, path, ReadRange::Full).await.unwrap(),
            b"hello world"
        );
        assert_eq!(
            transfer.read(&Owner::Local, path, ReadRange::Tail(5)).await.unwrap(),
            b"world"
        );

        transfer
            .write(&Owner::Local, path, b"replaced", WriteMode::Overwrite)
            .await
            .unwrap();
        assert_eq!(
            transfer.read(&Owner::Local, path, ReadRange::Head(3)).await.unwrap(),
            b"rep"
        );

        // 没有残留的临时文件
        let entries = std::fs::read_dir(dir.path().join("nested/dir")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_local_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, transfer) = setup(&FileSettings::default());
        let missing = dir.path().join("missing.txt");
        let err = transfer
            .read(&Owner::Local, missing.to_str().unwrap(), ReadRange::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));

        let no_parents = FileSettings {
            create_parents: false,
            ..Default::default()
        };
        let (_, _, strict) = setup(&no_parents);
        let deep = dir.path().join("a/b/c.txt");
        let err = strict
            .write(&Owner::Local, deep.to_str().unwrap(), b"x", WriteMode::Overwrite)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_local_root_confines_paths() {
        let dir = tempfile::tempdir().unwrap();
        let settings = FileSettings {
            local_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let (_, _, transfer) = setup(&settings);

        transfer
            .write(&Owner::Local, "/etc/app.conf", b"key=1", WriteMode::Overwrite)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("etc/app.conf")).unwrap(),
            b"key=1"
        );

        let err = transfer
            .read(&Owner::Local, "../outside.txt", ReadRange::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Permission(_)));
    }

    #[tokio::test]
    async fn test_remote_round_trip() {
        let (connector, registry, transfer) = setup(&FileSettings::default());
        let target = TargetDescriptor::with_default_port(
            "web1",
            "deploy",
            AuthMethod::Password(PASSWORD.into()),
        )
        .unwrap();
        let session_id = registry.connect(target).await.unwrap();
        let owner = Owner::Session(session_id.clone());

        transfer
            .write(&owner, "/srv/app.log", b"line1\n", WriteMode::Overwrite)
            .await
            .unwrap();
        transfer
            .write(&owner, "/srv/app.log", b"line2\n", WriteMode::Append)
            .await
            .unwrap();
        assert_eq!(
            transfer.read(&owner, "/srv/app.log", ReadRange::Full).await.unwrap(),
            b"line1\nline2\n"
        );
        assert_eq!(
            connector.remote_file("/srv/app.log").unwrap(),
            b"line1\nline2\n"
        );

        let err = transfer
            .read(&owner, "/srv/missing", ReadRange::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));

        registry.disconnect(&session_id).await.unwrap();
        let err = transfer
            .read(&owner, "/srv/app.log", ReadRange::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownSession(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_overwrite_keeps_mode_and_follows_symlinks() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let (_, _, transfer) = setup(&FileSettings::default());

        let script = dir.path().join("deploy.sh");
        std::fs::write(&script, "#!/bin/sh\necho old\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        transfer
            .write(&Owner::Local, script.to_str().unwrap(), b"#!/bin/sh\necho new\n", WriteMode::Overwrite)
            .await
            .unwrap();
        let mode = std::fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(std::fs::read(&script).unwrap(), b"#!/bin/sh\necho new\n");

        let link = dir.path().join("current.sh");
        std::os::unix::fs::symlink(&script, &link).unwrap();
        transfer
            .write(&Owner::Local, link.to_str().unwrap(), b"linked", WriteMode::Overwrite)
            .await
            .unwrap();
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(&script).unwrap(), b"linked");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_cannot_escape_local_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "keep").unwrap();
        std::os::unix::fs::symlink(&secret, root.path().join("escape.txt")).unwrap();

        let settings = FileSettings {
            local_root: Some(root.path().to_path_buf()),
            ..Default::default()
        };
        let (_, _, transfer) = setup(&settings);
        let err = transfer
            .write(&Owner::Local, "escape.txt", b"changed", WriteMode::Overwrite)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Permission(_)));
        assert_eq!(std::fs::read(&secret).unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_remote_ranges() {
        let (_, registry, transfer) = setup(&FileSettings::default());
        let session_id = registry.connect(target()).await.unwrap();
        let owner = Owner::Session(session_id);

        transfer
            .write(&owner, "/var/log/app.log", b"first\nsecond\nthird\n", WriteMode::Overwrite)
            .await
            .unwrap();
        assert_eq!(
            transfer.read(&owner, "/var/log/app.log", ReadRange::Head(5)).await.unwrap(),
            b"first"
        );
        assert_eq!(
            transfer.read(&owner, "/var/log/app.log", ReadRange::Tail(6)).await.unwrap(),
            b"third\n"
        );
    }

    #[tokio::test]
    async fn test_remote_transport_failure_marks_session_failed() {
        let (_, registry, transfer) = setup(&FileSettings::default());

        let session_id = registry.connect(target()).await.unwrap();
        let owner = Owner::Session(session_id.clone());
        let err = transfer
            .read(&owner, &format!("/tmp/{CONNECTION_RESET}"), ReadRange::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Transfer(_)));
        assert_eq!(registry.get(&session_id).unwrap().state(), SessionState::Failed);
        let err = transfer
            .read(&owner, "/tmp/other", ReadRange::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unreachable(_)));

        let session_id = registry.connect(target()).await.unwrap();
        let owner = Owner::Session(session_id.clone());
        let err = transfer
            .write(&owner, &format!("/tmp/{CONNECTION_RESET}"), b"x", WriteMode::Append)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Transfer(_)));
        assert_eq!(registry.get(&session_id).unwrap().state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_missing_remote_file_keeps_session_open() {
        let (_, registry, transfer) = setup(&FileSettings::default());
        let session_id = registry.connect(target()).await.unwrap();
        let err = transfer
            .read(&Owner::Session(session_id.clone()), "/nope", ReadRange::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
        assert_eq!(registry.get(&session_id).unwrap().state(), SessionState::Open);
    }
}
