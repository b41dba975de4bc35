#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::process::Stdio;
    use std::sync::OnceLock;
    use std::time::{Duration, SystemTime};

    use anyhow::{Context, Result, bail};
    use bytes::Bytes;
    use common::{
        ChangePreciousBit, ChangeStickyBit, ErrorKind, ForceSystemStickyBit, MigrationJobRequest,
        MigrationMode, RemoveReplica, ReplicaId, ReplicaState, ReplicaStatusRequest,
    };
    use pool_client::{PoolClient, remote_kind};
    use reqwest::StatusCode;
    use tokio::process::{Child, Command};
    use tokio::time::sleep;

    #[tokio::test]
    async fn qos_and_resilience_messages_against_live_node() -> Result<()> {
        let bind = "127.0.0.1:19180";
        let data_dir = fresh_data_dir("qos-resilience");
        let mut node = start_node("pool-a", bind, &data_dir, "").await?;
        let client = PoolClient::new(format!("http://{bind}"));

        let result = async {
            let id = ReplicaId::parse("live-qos")?;
            client
                .put_replica(&id, ReplicaState::Precious, Bytes::from_static(b"hello"))
                .await?;

            client
                .change_sticky_bit(&ChangeStickyBit {
                    file_id: id.clone(),
                    sticky: true,
                })
                .await?;
            client
                .change_precious_bit(&ChangePreciousBit {
                    file_id: id.clone(),
                })
                .await?;

            let status = client.qos_status(&status_request(&id)).await?;
            assert!(status.exists && status.readable && status.system_sticky);
            assert!(!status.precious && !status.removable);

            let err = client
                .remove_replica(&RemoveReplica {
                    file_id: id.clone(),
                })
                .await
                .expect_err("pinned replica must not be removable");
            assert_eq!(remote_kind(&err), Some(ErrorKind::Pinned));

            client
                .change_sticky_bit(&ChangeStickyBit {
                    file_id: id.clone(),
                    sticky: false,
                })
                .await?;
            client
                .remove_replica(&RemoveReplica {
                    file_id: id.clone(),
                })
                .await?;

            let status = client.resilience_status(&status_request(&id)).await?;
            assert!(!status.exists);
            Ok::<(), anyhow::Error>(())
        }
        .await;

        stop_node(&mut node).await;
        let _ = fs::remove_dir_all(&data_dir);
        result
    }

    #[tokio::test]
    async fn malformed_message_gets_typed_error_reply() -> Result<()> {
        let bind = "127.0.0.1:19181";
        let data_dir = fresh_data_dir("typed-errors");
        let mut node = start_node("pool-a", bind, &data_dir, "").await?;
        let http = reqwest::Client::new();

        let result = async {
            let response = http
                .post(format!("http://{bind}/qos/change-precious-bit"))
                .json(&serde_json::json!({ "file_id": "missing" }))
                .send()
                .await?;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            let body: serde_json::Value = response.json().await?;
            assert_eq!(body["kind"], "not_found");

            let response = http
                .put(format!("http://{bind}/replicas/bad?state=removed"))
                .body("x")
                .send()
                .await?;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            Ok::<(), anyhow::Error>(())
        }
        .await;

        stop_node(&mut node).await;
        let _ = fs::remove_dir_all(&data_dir);
        result
    }

    #[tokio::test]
    async fn replicas_survive_node_restart() -> Result<()> {
        let bind = "127.0.0.1:19182";
        let data_dir = fresh_data_dir("restart");
        let client = PoolClient::new(format!("http://{bind}"));
        let id = ReplicaId::parse("durable")?;

        let mut node = start_node("pool-a", bind, &data_dir, "").await?;
        let written = async {
            client
                .put_replica(&id, ReplicaState::Precious, Bytes::from_static(b"durable"))
                .await?;
            client
                .force_system_sticky(&ForceSystemStickyBit {
                    file_id: id.clone(),
                })
                .await
        }
        .await;
        stop_node(&mut node).await;
        written?;

        let mut node = start_node("pool-a", bind, &data_dir, "").await?;
        let result = async {
            let status = client.qos_status(&status_request(&id)).await?;
            assert!(status.exists && status.precious && status.system_sticky);
            Ok::<(), anyhow::Error>(())
        }
        .await;

        stop_node(&mut node).await;
        let _ = fs::remove_dir_all(&data_dir);
        result
    }

    #[tokio::test]
    async fn migration_between_live_nodes() -> Result<()> {
        let source_bind = "127.0.0.1:19183";
        let dest_bind = "127.0.0.1:19184";
        let pools = format!("source=http://{source_bind},dest=http://{dest_bind}");
        let source_dir = fresh_data_dir("migration-source");
        let dest_dir = fresh_data_dir("migration-dest");

        let mut source = start_node("source", source_bind, &source_dir, &pools).await?;
        let mut dest = start_node("dest", dest_bind, &dest_dir, &pools).await?;
        let source_client = PoolClient::new(format!("http://{source_bind}"));
        let dest_client = PoolClient::new(format!("http://{dest_bind}"));

        let result = async {
            let copied = ReplicaId::parse("copied")?;
            source_client
                .put_replica(&copied, ReplicaState::Cached, Bytes::from_static(b"copy me"))
                .await?;
            let report = source_client
                .start_migration(&MigrationJobRequest {
                    file_id: copied.clone(),
                    mode: MigrationMode::Copy,
                })
                .await?;
            assert_eq!(report.destination, "dest");
            assert_eq!(report.bytes_sent, 7);
            assert!(!report.source_removed);
            assert!(dest_client.qos_status(&status_request(&copied)).await?.readable);
            assert!(source_client.qos_status(&status_request(&copied)).await?.exists);

            let again = source_client
                .start_migration(&MigrationJobRequest {
                    file_id: copied.clone(),
                    mode: MigrationMode::Copy,
                })
                .await?;
            assert!(again.already_present);
            assert_eq!(again.bytes_sent, 0);

            let moved = ReplicaId::parse("moved")?;
            source_client
                .put_replica(&moved, ReplicaState::Precious, Bytes::from_static(b"move me"))
                .await?;
            let report = source_client
                .start_migration(&MigrationJobRequest {
                    file_id: moved.clone(),
                    mode: MigrationMode::Move,
                })
                .await?;
            assert!(report.source_removed);
            assert!(!source_client.qos_status(&status_request(&moved)).await?.exists);
            let status = dest_client.qos_status(&status_request(&moved)).await?;
            assert!(status.exists && status.precious);
            Ok::<(), anyhow::Error>(())
        }
        .await;

        stop_node(&mut source).await;
        stop_node(&mut dest).await;
        let _ = fs::remove_dir_all(&source_dir);
        let _ = fs::remove_dir_all(&dest_dir);
        result
    }

    fn status_request(id: &ReplicaId) -> ReplicaStatusRequest {
        ReplicaStatusRequest {
            file_id: id.clone(),
            sticky_owner: None,
        }
    }

    async fn start_node(
        pool_name: &str,
        bind: &str,
        data_dir: &Path,
        fixed_pools: &str,
    ) -> Result<Child> {
        let node_bin = binary_path("pool-node")?;

        let mut command = Command::new(node_bin);
        command
            .env("POOLMESH_POOL_NAME", pool_name)
            .env("POOLMESH_HTTP_BIND", bind)
            .env("POOLMESH_DATA_DIR", data_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if !fixed_pools.is_empty() {
            command.env("POOLMESH_FIXED_POOLS", fixed_pools);
        }

        let child = command.spawn().context("failed to spawn pool-node")?;
        wait_for_url_status(&format!("http://{bind}/health"), StatusCode::OK, 60).await?;
        Ok(child)
    }

    async fn wait_for_url_status(url: &str, expected: StatusCode, retries: usize) -> Result<()> {
        let http = reqwest::Client::new();

        for _ in 0..retries {
            if let Ok(resp) = http.get(url).send().await
                && resp.status() == expected
            {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }

        bail!("service did not return {expected} at {url}");
    }

    async fn stop_node(child: &mut Child) {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    fn binary_path(name: &str) -> Result<PathBuf> {
        let workspace_root = workspace_root()?;
        ensure_binaries_built(&workspace_root)?;
        let mut path = workspace_root.join("target").join("debug").join(name);

        if let Some(suffix) = std::env::consts::EXE_SUFFIX.strip_prefix('.') {
            let mut filename = OsString::from(name);
            filename.push(".");
            filename.push(suffix);
            path = workspace_root.join("target").join("debug").join(filename);
        }

        if !path.exists() {
            bail!("expected binary does not exist: {}", path.display());
        }

        Ok(path)
    }

    fn workspace_root() -> Result<PathBuf> {
        let crate_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        crate_dir
            .parent()
            .and_then(|p| p.parent())
            .map(PathBuf::from)
            .context("failed to resolve workspace root")
    }

    fn ensure_binaries_built(workspace_root: &Path) -> Result<()> {
        static BUILD_RESULT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

        let result = BUILD_RESULT.get_or_init(|| {
            let status = std::process::Command::new("cargo")
                .args(["build", "-p", "pool-node"])
                .current_dir(workspace_root)
                .status();
            match status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(format!("cargo build exited with {status}")),
                Err(err) => Err(err.to_string()),
            }
        });

        if let Err(message) = result {
            bail!("failed to build pool-node: {message}");
        }

        Ok(())
    }

    fn fresh_data_dir(name: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path = std::env::temp_dir().join(format!("poolmesh-{name}-{unique}"));
        let _ = fs::remove_dir_all(&path);
        let _ = fs::create_dir_all(&path);
        path
    }
}
