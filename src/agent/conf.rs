//! Configuration-file handlers. Each request carries one item per segment
//! on this host; items are processed concurrently and every failure is
//! reported.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::fanout;
use crate::step::stream::DevNullStream;
use crate::upgrade::conf;
use crate::upgrade::pg_control::restore_pg_control;

#[derive(Debug, Clone)]
pub struct ReplicationEntry {
    pub data_dir: PathBuf,
    pub user: String,
    pub host_addrs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RecoveryConnection {
    pub mirror_data_dir: PathBuf,
    pub user: String,
    pub primary_host: String,
    pub primary_port: i32,
}

/// A port substitution in one file.
#[derive(Debug, Clone)]
pub struct PortChange {
    pub path: PathBuf,
    pub current: i32,
    pub updated: i32,
}

async fn blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

pub async fn add_replication_entries(entries: Vec<ReplicationEntry>) -> Result<()> {
    fanout::for_each(entries, |entry| {
        blocking(move || conf::append_replication_entries(&entry.data_dir, &entry.user, &entry.host_addrs))
    })
    .await
}

pub async fn create_recovery_conf(connections: Vec<RecoveryConnection>) -> Result<()> {
    fanout::for_each(connections, |c| {
        blocking(move || {
            conf::write_recovery_conf(&c.mirror_data_dir, &c.user, &c.primary_host, c.primary_port)
        })
    })
    .await
}

pub async fn update_postgresql_conf(changes: Vec<PortChange>) -> Result<()> {
    fanout::for_each(changes, |c| {
        blocking(move || conf::update_port_in_file(&c.path, c.current, c.updated))
    })
    .await
}

pub async fn update_recovery_conf(changes: Vec<PortChange>) -> Result<()> {
    fanout::for_each(changes, |c| {
        blocking(move || conf::update_conninfo_port_in_file(&c.path, c.current, c.updated))
    })
    .await
}

pub async fn restore_pg_controls(datadirs: Vec<PathBuf>) -> Result<()> {
    fanout::for_each(datadirs, |dir| {
        blocking(move || {
            restore_pg_control(&dir, &DevNullStream)
                .map_err(|e: Error| e.context(format!("restoring pg_control in {:?}", dir)))
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_replication_entries_appends() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("pg_hba.conf"), "some existing text\n").unwrap();

        add_replication_entries(vec![ReplicationEntry {
            data_dir: tmp.path().to_path_buf(),
            user: "gpadmin".into(),
            host_addrs: vec!["127.0.0.1".into(), "127.0.0.2".into()],
        }])
        .await
        .unwrap();

        let text = std::fs::read_to_string(tmp.path().join("pg_hba.conf")).unwrap();
        assert_eq!(
            text,
            "some existing text\n\
             host replication gpadmin samehost trust\n\
             host all gpadmin 127.0.0.1 trust\n\
             host replication gpadmin 127.0.0.1 trust\n\
             host all gpadmin 127.0.0.2 trust\n\
             host replication gpadmin 127.0.0.2 trust\n"
        );
    }

    #[tokio::test]
    async fn test_add_replication_entries_collects_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let entries = (0..3)
            .map(|i| ReplicationEntry {
                data_dir: tmp.path().join(format!("missing{}", i)),
                user: "gpadmin".into(),
                host_addrs: vec![],
            })
            .collect();

        let err = add_replication_entries(entries).await.unwrap_err();
        assert_eq!(err.as_multi().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_create_recovery_conf() {
        let tmp = tempfile::tempdir().unwrap();
        let mirror = tmp.path().join("m1");
        std::fs::create_dir(&mirror).unwrap();

        create_recovery_conf(vec![RecoveryConnection {
            mirror_data_dir: mirror.clone(),
            user: "gpadmin".into(),
            primary_host: "sdw1".into(),
            primary_port: 123,
        }])
        .await
        .unwrap();

        assert_eq!(std::fs::read(mirror.join("standby.signal")).unwrap(), b"");
        let auto = std::fs::read_to_string(mirror.join("postgresql.auto.conf")).unwrap();
        assert!(auto
            .lines()
            .next()
            .unwrap()
            .starts_with("primary_conninfo = 'user=gpadmin host=sdw1 port=123 "));
    }

    #[tokio::test]
    async fn test_update_conf_files() {
        let tmp = tempfile::tempdir().unwrap();
        let pg_conf = tmp.path().join("postgresql.conf");
        let auto_conf = tmp.path().join("postgresql.auto.conf");
        std::fs::write(&pg_conf, "port = 50434\n").unwrap();
        std::fs::write(
            &auto_conf,
            "primary_conninfo = 'user=gpadmin host=sdw1 port=50434 sslmode=disable'\n",
        )
        .unwrap();

        update_postgresql_conf(vec![PortChange {
            path: pg_conf.clone(),
            current: 50434,
            updated: 25432,
        }])
        .await
        .unwrap();
        update_recovery_conf(vec![PortChange {
            path: auto_conf.clone(),
            current: 50434,
            updated: 25432,
        }])
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(&pg_conf).unwrap(), "port = 25432\n");
        assert!(std::fs::read_to_string(&auto_conf).unwrap().contains("port=25432 "));
    }

    #[tokio::test]
    async fn test_restore_pg_controls_collects_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("good");
        std::fs::create_dir_all(good.join("global")).unwrap();
        std::fs::write(good.join("global/pg_control.old"), "").unwrap();

        let err = restore_pg_controls(vec![good.clone(), tmp.path().join("a"), tmp.path().join("b")])
            .await
            .unwrap_err();

        assert!(good.join("global/pg_control").exists());
        assert_eq!(err.as_multi().unwrap().len(), 2);
    }
}
