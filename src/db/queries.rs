use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use crate::db::{Database, Table};
use crate::errors::Result;
use crate::models::{AppStatus, ApplicationRecord, Download, DownloadLink, DownloadStatus};

pub trait SettingsQueries {
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn delete_setting(&self, key: &str) -> Result<()>;
    /// Writes every pair in one transaction.
    fn set_settings(&self, entries: &[(&str, &str)]) -> Result<()>;
    fn delete_settings(&self, keys: &[&str]) -> Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DownloadProgress {
    pub progress: i32,
    pub file_size: i64,
    pub speed: i64,
    pub time_remaining: i64,
    pub downloaded_files: i32,
}

pub trait DownloadQueries {
    fn upsert_download(&self, download: &Download) -> Result<()>;
    fn get_download(&self, package_name: &str) -> Result<Option<Download>>;
    fn get_downloads(&self) -> Result<Vec<Download>>;
    fn downloads_with_status(&self, statuses: &[DownloadStatus]) -> Result<Vec<Download>>;
    fn active_download(&self) -> Result<Option<Download>>;
    /// Moves the oldest queued row to DOWNLOADING when nothing is active.
    fn claim_next_queued(&self) -> Result<Option<Download>>;
    fn update_download_status(
        &self,
        package_name: &str,
        status: DownloadStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;
    fn transition_download(
        &self,
        package_name: &str,
        from: &[DownloadStatus],
        to: DownloadStatus,
    ) -> Result<bool>;
    /// COMPLETED -> INSTALLING, only while no other row is active.
    fn claim_for_install(&self, package_name: &str) -> Result<bool>;
    fn update_download_progress(&self, package_name: &str, progress: &DownloadProgress)
        -> Result<bool>;
    fn set_download_artifact(&self, package_name: &str, path: &str) -> Result<bool>;
    fn set_download_link(&self, package_name: &str, link: &DownloadLink) -> Result<bool>;
    fn remove_download(&self, package_name: &str) -> Result<bool>;
    fn cancel_queued_downloads(&self, updates_only: bool) -> Result<Vec<String>>;
    fn remove_downloads_with_status(&self, statuses: &[DownloadStatus]) -> Result<Vec<Download>>;
}

pub trait ApplicationQueries {
    fn upsert_application(&self, record: &ApplicationRecord) -> Result<()>;
    fn get_application(&self, package_name: &str) -> Result<Option<ApplicationRecord>>;
    fn get_applications(&self) -> Result<Vec<ApplicationRecord>>;
    fn update_application_status(&self, package_name: &str, status: AppStatus) -> Result<bool>;
    /// Persists status and installed version together, recomputing `has_update`.
    fn update_installed_version(
        &self,
        package_name: &str,
        version_code: i64,
        status: AppStatus,
    ) -> Result<bool>;
    fn mark_not_installed(&self, package_name: &str) -> Result<bool>;
    fn set_favorite(&self, package_name: &str, favorite: bool) -> Result<bool>;
    fn increment_retry_count(&self, package_name: &str) -> Result<bool>;
    fn delete_application(&self, package_name: &str) -> Result<bool>;
}

const DOWNLOAD_COLUMNS: &str = "package_name, session_id, url, version, version_code, is_update,
    display_name, icon, status, progress, file_size, speed, time_remaining, total_files,
    downloaded_files, apk_location, md5, is_installed, error_message, enqueued_at, updated_at";

const APPLICATION_COLUMNS: &str = "package_name, uuid, name, version, version_code,
    latest_version_code, has_update, status, is_favorite, retry_count, updated_at";

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_column<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(index)?;
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err)))
}

fn download_from_row(row: &Row<'_>) -> rusqlite::Result<Download> {
    Ok(Download {
        package_name: row.get(0)?,
        session_id: row.get(1)?,
        url: row.get(2)?,
        version: row.get(3)?,
        version_code: row.get(4)?,
        is_update: row.get(5)?,
        display_name: row.get(6)?,
        icon: row.get(7)?,
        status: parse_column(row, 8)?,
        progress: row.get(9)?,
        file_size: row.get(10)?,
        speed: row.get(11)?,
        time_remaining: row.get(12)?,
        total_files: row.get(13)?,
        downloaded_files: row.get(14)?,
        apk_location: row.get(15)?,
        md5: row.get(16)?,
        is_installed: row.get(17)?,
        error_message: row.get(18)?,
        enqueued_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

fn application_from_row(row: &Row<'_>) -> rusqlite::Result<ApplicationRecord> {
    Ok(ApplicationRecord {
        package_name: row.get(0)?,
        uuid: row.get(1)?,
        name: row.get(2)?,
        version: row.get(3)?,
        version_code: row.get(4)?,
        latest_version_code: row.get(5)?,
        has_update: row.get(6)?,
        status: parse_column(row, 7)?,
        is_favorite: row.get(8)?,
        retry_count: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn status_placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn status_values(statuses: &[DownloadStatus]) -> Vec<&'static str> {
    statuses.iter().map(DownloadStatus::as_str).collect()
}

/// Upserts keep the row's rowid, which breaks FIFO ties between equal `enqueued_at`.
fn download_update_assignments() -> String {
    DOWNLOAD_COLUMNS
        .split(',')
        .map(str::trim)
        .filter(|column| *column != "package_name")
        .map(|column| format!("{column} = excluded.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_download(conn: &rusqlite::Connection, download: &Download) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO download ({DOWNLOAD_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
             ON CONFLICT(package_name) DO UPDATE SET {}",
            download_update_assignments()
        ),
        params![
            download.package_name,
            download.session_id,
            download.url,
            download.version,
            download.version_code,
            download.is_update,
            download.display_name,
            download.icon,
            download.status.as_str(),
            download.progress,
            download.file_size,
            download.speed,
            download.time_remaining,
            download.total_files,
            download.downloaded_files,
            download.apk_location,
            download.md5,
            download.is_installed,
            download.error_message,
            download.enqueued_at,
            download.updated_at,
        ],
    )
}

impl SettingsQueries for Database {
    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.set_settings(&[(key, value)])
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn delete_setting(&self, key: &str) -> Result<()> {
        self.delete_settings(&[key])
    }

    fn set_settings(&self, entries: &[(&str, &str)]) -> Result<()> {
        {
            let mut conn = self.connection()?;
            let tx = conn.transaction()?;
            let now = now_millis();
            for (key, value) in entries {
                tx.execute(
                    "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
                    params![key, value, now],
                )?;
            }
            tx.commit()?;
        }
        self.notify(Table::Settings);
        Ok(())
    }

    fn delete_settings(&self, keys: &[&str]) -> Result<()> {
        {
            let mut conn = self.connection()?;
            let tx = conn.transaction()?;
            for key in keys {
                tx.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
            }
            tx.commit()?;
        }
        self.notify(Table::Settings);
        Ok(())
    }
}

impl DownloadQueries for Database {
    fn upsert_download(&self, download: &Download) -> Result<()> {
        {
            let conn = self.connection()?;
            insert_download(&conn, download)?;
        }
        self.notify(Table::Downloads);
        Ok(())
    }

    fn get_download(&self, package_name: &str) -> Result<Option<Download>> {
        let conn = self.connection()?;
        let download = conn
            .query_row(
                &format!("SELECT {DOWNLOAD_COLUMNS} FROM download WHERE package_name = ?1"),
                params![package_name],
                download_from_row,
            )
            .optional()?;
        Ok(download)
    }

    fn get_downloads(&self) -> Result<Vec<Download>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM download ORDER BY enqueued_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map([], download_from_row)?;

        let mut downloads = Vec::new();
        for item in rows {
            downloads.push(item?);
        }
        Ok(downloads)
    }

    fn downloads_with_status(&self, statuses: &[DownloadStatus]) -> Result<Vec<Download>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM download WHERE status IN ({})
             ORDER BY enqueued_at ASC, rowid ASC",
            status_placeholders(1, statuses.len())
        ))?;
        let rows = stmt.query_map(params_from_iter(status_values(statuses)), download_from_row)?;

        let mut downloads = Vec::new();
        for item in rows {
            downloads.push(item?);
        }
        Ok(downloads)
    }

    fn active_download(&self) -> Result<Option<Download>> {
        Ok(self
            .downloads_with_status(&DownloadStatus::ACTIVE)?
            .into_iter()
            .next())
    }

    fn claim_next_queued(&self) -> Result<Option<Download>> {
        let claimed = {
            let mut conn = self.connection()?;
            let tx = conn.transaction()?;
            let active: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM download WHERE status IN ({})",
                    status_placeholders(1, DownloadStatus::ACTIVE.len())
                ),
                params_from_iter(status_values(&DownloadStatus::ACTIVE)),
                |row| row.get(0),
            )?;
            if active > 0 {
                return Ok(None);
            }

            let next = tx
                .query_row(
                    &format!(
                        "SELECT {DOWNLOAD_COLUMNS} FROM download WHERE status = ?1
                         ORDER BY enqueued_at ASC, rowid ASC LIMIT 1"
                    ),
                    params![DownloadStatus::Queued.as_str()],
                    download_from_row,
                )
                .optional()?;
            let Some(mut next) = next else {
                return Ok(None);
            };

            next.status = DownloadStatus::Downloading;
            next.updated_at = now_millis();
            tx.execute(
                "UPDATE download SET status = ?1, error_message = NULL, updated_at = ?2
                 WHERE package_name = ?3",
                params![next.status.as_str(), next.updated_at, next.package_name],
            )?;
            tx.commit()?;
            next
        };
        self.notify(Table::Downloads);
        Ok(Some(claimed))
    }

    fn update_download_status(
        &self,
        package_name: &str,
        status: DownloadStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let changed = {
            let conn = self.connection()?;
            conn.execute(
                "UPDATE download SET status = ?1, error_message = ?2, updated_at = ?3
                 WHERE package_name = ?4",
                params![status.as_str(), error_message, now_millis(), package_name],
            )?
        };
        if changed > 0 {
            self.notify(Table::Downloads);
        }
        Ok(changed > 0)
    }

    fn transition_download(
        &self,
        package_name: &str,
        from: &[DownloadStatus],
        to: DownloadStatus,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let changed = {
            let conn = self.connection()?;
            let sql = format!(
                "UPDATE download SET status = ?1, updated_at = ?2
                 WHERE package_name = ?3 AND status IN ({})",
                status_placeholders(4, from.len())
            );
            let mut values: Vec<rusqlite::types::Value> = vec![
                to.as_str().to_string().into(),
                now_millis().into(),
                package_name.to_string().into(),
            ];
            values.extend(from.iter().map(|status| status.as_str().to_string().into()));
            conn.execute(&sql, params_from_iter(values))?
        };
        if changed > 0 {
            self.notify(Table::Downloads);
        }
        Ok(changed > 0)
    }

    fn claim_for_install(&self, package_name: &str) -> Result<bool> {
        let changed = {
            let conn = self.connection()?;
            let sql = format!(
                "UPDATE download SET status = ?1, error_message = NULL, updated_at = ?2
                 WHERE package_name = ?3 AND status = ?4
                   AND NOT EXISTS (
                       SELECT 1 FROM download
                       WHERE package_name != ?3 AND status IN ({})
                   )",
                status_placeholders(5, DownloadStatus::ACTIVE.len())
            );
            let mut values: Vec<rusqlite::types::Value> = vec![
                DownloadStatus::Installing.as_str().to_string().into(),
                now_millis().into(),
                package_name.to_string().into(),
                DownloadStatus::Completed.as_str().to_string().into(),
            ];
            values.extend(
                DownloadStatus::ACTIVE
                    .iter()
                    .map(|status| status.as_str().to_string().into()),
            );
            conn.execute(&sql, params_from_iter(values))?
        };
        if changed > 0 {
            self.notify(Table::Downloads);
        }
        Ok(changed > 0)
    }

    fn update_download_progress(
        &self,
        package_name: &str,
        progress: &DownloadProgress,
    ) -> Result<bool> {
        let changed = {
            let conn = self.connection()?;
            conn.execute(
                "UPDATE download SET progress = ?1, file_size = ?2, speed = ?3,
                    time_remaining = ?4, downloaded_files = ?5, updated_at = ?6
                 WHERE package_name = ?7",
                params![
                    progress.progress.clamp(0, 100),
                    progress.file_size,
                    progress.speed,
                    progress.time_remaining,
                    progress.downloaded_files,
                    now_millis(),
                    package_name,
                ],
            )?
        };
        if changed > 0 {
            self.notify(Table::Downloads);
        }
        Ok(changed > 0)
    }

    fn set_download_artifact(&self, package_name: &str, path: &str) -> Result<bool> {
        let changed = {
            let conn = self.connection()?;
            conn.execute(
                "UPDATE download SET apk_location = ?1, updated_at = ?2 WHERE package_name = ?3",
                params![path, now_millis(), package_name],
            )?
        };
        if changed > 0 {
            self.notify(Table::Downloads);
        }
        Ok(changed > 0)
    }

    fn set_download_link(&self, package_name: &str, link: &DownloadLink) -> Result<bool> {
        let changed = {
            let conn = self.connection()?;
            conn.execute(
                "UPDATE download SET url = ?1, version = ?2, version_code = ?3,
                    md5 = COALESCE(?4, md5), file_size = COALESCE(?5, file_size), updated_at = ?6
                 WHERE package_name = ?7",
                params![
                    link.url,
                    link.version,
                    link.version_code,
                    link.md5,
                    link.file_size,
                    now_millis(),
                    package_name,
                ],
            )?
        };
        if changed > 0 {
            self.notify(Table::Downloads);
        }
        Ok(changed > 0)
    }

    fn remove_download(&self, package_name: &str) -> Result<bool> {
        let changed = {
            let conn = self.connection()?;
            conn.execute(
                "DELETE FROM download WHERE package_name = ?1",
                params![package_name],
            )?
        };
        if changed > 0 {
            self.notify(Table::Downloads);
        }
        Ok(changed > 0)
    }

    fn cancel_queued_downloads(&self, updates_only: bool) -> Result<Vec<String>> {
        let cancelled = {
            let mut conn = self.connection()?;
            let tx = conn.transaction()?;
            let packages = {
                let mut stmt = tx.prepare(
                    "SELECT package_name FROM download
                     WHERE status = ?1 AND (?2 = 0 OR is_update = 1)
                     ORDER BY enqueued_at ASC, rowid ASC",
                )?;
                let rows = stmt.query_map(
                    params![DownloadStatus::Queued.as_str(), updates_only],
                    |row| row.get::<_, String>(0),
                )?;
                let mut packages = Vec::new();
                for item in rows {
                    packages.push(item?);
                }
                packages
            };
            let now = now_millis();
            for package in &packages {
                tx.execute(
                    "UPDATE download SET status = ?1, updated_at = ?2
                     WHERE package_name = ?3 AND status = ?4",
                    params![
                        DownloadStatus::Cancelled.as_str(),
                        now,
                        package,
                        DownloadStatus::Queued.as_str()
                    ],
                )?;
            }
            tx.commit()?;
            packages
        };
        if !cancelled.is_empty() {
            self.notify(Table::Downloads);
        }
        Ok(cancelled)
    }

    fn remove_downloads_with_status(&self, statuses: &[DownloadStatus]) -> Result<Vec<Download>> {
        let removed = self.downloads_with_status(statuses)?;
        if removed.is_empty() {
            return Ok(removed);
        }
        {
            let mut conn = self.connection()?;
            let tx = conn.transaction()?;
            for download in &removed {
                tx.execute(
                    "DELETE FROM download WHERE package_name = ?1 AND status = ?2",
                    params![download.package_name, download.status.as_str()],
                )?;
            }
            tx.commit()?;
        }
        self.notify(Table::Downloads);
        Ok(removed)
    }
}

impl ApplicationQueries for Database {
    fn upsert_application(&self, record: &ApplicationRecord) -> Result<()> {
        {
            let conn = self.connection()?;
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO application ({APPLICATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    record.package_name,
                    record.uuid,
                    record.name,
                    record.version,
                    record.version_code,
                    record.latest_version_code,
                    record.latest_version_code > record.version_code,
                    record.status.as_str(),
                    record.is_favorite,
                    record.retry_count,
                    now_millis(),
                ],
            )?;
        }
        self.notify(Table::Applications);
        Ok(())
    }

    fn get_application(&self, package_name: &str) -> Result<Option<ApplicationRecord>> {
        let conn = self.connection()?;
        let record = conn
            .query_row(
                &format!("SELECT {APPLICATION_COLUMNS} FROM application WHERE package_name = ?1"),
                params![package_name],
                application_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn get_applications(&self) -> Result<Vec<ApplicationRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM application ORDER BY name COLLATE NOCASE ASC"
        ))?;
        let rows = stmt.query_map([], application_from_row)?;

        let mut records = Vec::new();
        for item in rows {
            records.push(item?);
        }
        Ok(records)
    }

    fn update_application_status(&self, package_name: &str, status: AppStatus) -> Result<bool> {
        self.execute_application_update(
            "UPDATE application SET status = ?1, updated_at = ?2 WHERE package_name = ?3",
            params![status.as_str(), now_millis(), package_name],
        )
    }

    fn update_installed_version(
        &self,
        package_name: &str,
        version_code: i64,
        status: AppStatus,
    ) -> Result<bool> {
        self.execute_application_update(
            "UPDATE application SET status = ?1, version_code = ?2,
                has_update = (latest_version_code > ?2), retry_count = 0, updated_at = ?3
             WHERE package_name = ?4",
            params![status.as_str(), version_code, now_millis(), package_name],
        )
    }

    fn mark_not_installed(&self, package_name: &str) -> Result<bool> {
        self.execute_application_update(
            "UPDATE application SET status = ?1, has_update = 0, version = NULL,
                version_code = 0, updated_at = ?2
             WHERE package_name = ?3",
            params![AppStatus::NotInstalled.as_str(), now_millis(), package_name],
        )
    }

    fn set_favorite(&self, package_name: &str, favorite: bool) -> Result<bool> {
        self.execute_application_update(
            "UPDATE application SET is_favorite = ?1, updated_at = ?2 WHERE package_name = ?3",
            params![favorite, now_millis(), package_name],
        )
    }

    fn increment_retry_count(&self, package_name: &str) -> Result<bool> {
        self.execute_application_update(
            "UPDATE application SET retry_count = retry_count + 1, updated_at = ?1
             WHERE package_name = ?2",
            params![now_millis(), package_name],
        )
    }

    fn delete_application(&self, package_name: &str) -> Result<bool> {
        self.execute_application_update(
            "DELETE FROM application WHERE package_name = ?1",
            params![package_name],
        )
    }
}

impl Database {
    fn execute_application_update(&self, sql: &str, values: impl rusqlite::Params) -> Result<bool> {
        let changed = {
            let conn = self.connection()?;
            conn.execute(sql, values)?
        };
        if changed > 0 {
            self.notify(Table::Applications);
        }
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(package: &str, enqueued_at: i64) -> Download {
        let mut download = Download::new(package, package, "1.0", 1);
        download.enqueued_at = enqueued_at;
        download
    }

    #[test]
    fn settings_round_trip_and_batch_delete() {
        let db = Database::in_memory().expect("open db");
        db.set_settings(&[("a", "1"), ("b", "2")]).expect("write batch");
        assert_eq!(db.get_setting("a").expect("read a").as_deref(), Some("1"));
        db.delete_settings(&["a", "b"]).expect("delete batch");
        assert!(db.get_setting("b").expect("read b").is_none());
    }

    #[test]
    fn claim_respects_fifo_and_single_active_row() {
        let db = Database::in_memory().expect("open db");
        db.upsert_download(&queued("com.example.b", 20)).expect("insert b");
        db.upsert_download(&queued("com.example.a", 10)).expect("insert a");

        let first = db.claim_next_queued().expect("claim").expect("a claimed");
        assert_eq!(first.package_name, "com.example.a");
        assert_eq!(first.status, DownloadStatus::Downloading);
        assert!(db.claim_next_queued().expect("second claim").is_none());

        db.update_download_status("com.example.a", DownloadStatus::Failed, Some("boom"))
            .expect("fail a");
        let second = db.claim_next_queued().expect("claim").expect("b claimed");
        assert_eq!(second.package_name, "com.example.b");
    }

    #[test]
    fn reupsert_keeps_position_among_equal_timestamps() {
        let db = Database::in_memory().expect("open db");
        db.upsert_download(&queued("com.example.a", 10)).expect("insert a");
        db.upsert_download(&queued("com.example.b", 10)).expect("insert b");

        let mut refreshed = queued("com.example.a", 10);
        refreshed.display_name = "A renamed".to_string();
        db.upsert_download(&refreshed).expect("re-upsert a");

        let order: Vec<String> = db
            .get_downloads()
            .expect("list")
            .into_iter()
            .map(|download| download.package_name)
            .collect();
        assert_eq!(order, vec!["com.example.a", "com.example.b"]);
        let row = db.get_download("com.example.a").expect("read").expect("row");
        assert_eq!(row.display_name, "A renamed");
        let first = db.claim_next_queued().expect("claim").expect("a claimed");
        assert_eq!(first.package_name, "com.example.a");
    }

    #[test]
    fn transition_only_applies_from_expected_states() {
        let db = Database::in_memory().expect("open db");
        db.upsert_download(&queued("com.example.a", 1)).expect("insert");
        assert!(!db
            .transition_download(
                "com.example.a",
                &[DownloadStatus::Downloading],
                DownloadStatus::Verifying
            )
            .expect("transition"));
        assert!(db
            .transition_download("com.example.a", &[DownloadStatus::Queued], DownloadStatus::Cancelled)
            .expect("transition"));
        let row = db.get_download("com.example.a").expect("read").expect("row");
        assert_eq!(row.status, DownloadStatus::Cancelled);
    }

    #[test]
    fn install_claim_waits_for_other_active_rows() {
        let db = Database::in_memory().expect("open db");
        db.upsert_download(&queued("com.example.a", 1)).expect("insert a");
        db.upsert_download(&queued("com.example.b", 2)).expect("insert b");
        db.update_download_status("com.example.a", DownloadStatus::Completed, None)
            .expect("complete a");
        db.update_download_status("com.example.b", DownloadStatus::Downloading, None)
            .expect("start b");

        assert!(!db.claim_for_install("com.example.a").expect("claim"));
        db.update_download_status("com.example.b", DownloadStatus::Failed, None)
            .expect("fail b");
        assert!(db.claim_for_install("com.example.a").expect("claim"));
        assert!(!db.claim_for_install("com.example.a").expect("second claim"));
    }

    #[test]
    fn cancel_queued_can_filter_updates() {
        let db = Database::in_memory().expect("open db");
        db.upsert_download(&queued("com.example.fresh", 1)).expect("insert");
        db.upsert_download(&queued("com.example.update", 2).as_update())
            .expect("insert");

        let cancelled = db.cancel_queued_downloads(true).expect("cancel updates");
        assert_eq!(cancelled, vec!["com.example.update".to_string()]);
        let fresh = db.get_download("com.example.fresh").expect("read").expect("row");
        assert_eq!(fresh.status, DownloadStatus::Queued);
    }

    #[test]
    fn installed_version_update_recomputes_has_update() {
        let db = Database::in_memory().expect("open db");
        let mut record = ApplicationRecord::new("com.example.a", "A");
        record.latest_version_code = 5;
        record.retry_count = 2;
        db.upsert_application(&record).expect("insert");

        db.update_installed_version("com.example.a", 4, AppStatus::UpdateAvailable)
            .expect("update");
        let stored = db.get_application("com.example.a").expect("read").expect("row");
        assert!(stored.has_update);
        assert_eq!(stored.retry_count, 0);

        db.update_installed_version("com.example.a", 5, AppStatus::Installed)
            .expect("update");
        let stored = db.get_application("com.example.a").expect("read").expect("row");
        assert!(!stored.has_update);
        assert_eq!(stored.status, AppStatus::Installed);
    }
}
