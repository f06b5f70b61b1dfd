//! Audit Store - SQLite 기반 감사 이벤트 저장소
//!
//! append-only 테이블입니다. `seq`로 같은 timestamp끼리도 삽입 순서가
//! 유지되므로 최신순 조회 결과가 항상 안정적입니다.

use super::types::{AuditAction, AuditEvent, AuditId};
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info, warn};

/// 감사 이벤트 저장소
pub struct AuditStore {
    db: Mutex<Connection>,
}

impl AuditStore {
    /// 파일 DB 열기 (상위 디렉토리 자동 생성)
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!(db_path = %path.display(), "Audit store opened");
        Ok(store)
    }

    /// 인메모리 DB (테스트용)
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                task_id TEXT NOT NULL,
                action TEXT NOT NULL,
                detail TEXT NOT NULL,
                actor TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_audit_events_ts ON audit_events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_events_task ON audit_events(task_id);
            "#,
        )?;

        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// 이벤트 추가
    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        let detail = serde_json::to_string(&event.detail)?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO audit_events (id, timestamp, task_id, action, detail, actor)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.0,
                format_ts(&event.timestamp),
                event.task_id,
                event.action.as_str(),
                detail,
                event.actor,
            ],
        )?;

        debug!(
            audit_id = %event.id,
            task_id = %event.task_id,
            action = event.action.as_str(),
            "Audit event stored"
        );
        Ok(())
    }

    /// 최신순 페이지 조회
    pub fn query(&self, limit: usize, offset: usize) -> Result<Vec<AuditEvent>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT id, timestamp, task_id, action, detail, actor FROM audit_events
             ORDER BY timestamp DESC, seq DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![to_sql_int(limit), to_sql_int(offset)], row_to_raw)?;
        collect_events(rows)
    }

    /// 한 Task의 이벤트 (발생 순서대로)
    pub fn query_task(&self, task_id: &str) -> Result<Vec<AuditEvent>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT id, timestamp, task_id, action, detail, actor FROM audit_events
             WHERE task_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![task_id], row_to_raw)?;
        collect_events(rows)
    }

    pub fn count(&self) -> Result<u64> {
        let db = self.db.lock();
        let count: i64 = db.query_row("SELECT COUNT(*) FROM audit_events", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// `cutoff`보다 오래된 이벤트 삭제
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let db = self.db.lock();
        let deleted = db.execute(
            "DELETE FROM audit_events WHERE timestamp < ?1",
            params![format_ts(&cutoff)],
        )?;

        if deleted > 0 {
            info!(deleted = deleted, cutoff = %cutoff, "Pruned old audit events");
        }
        Ok(deleted as u64)
    }
}

// ============================================================================
// 헬퍼 함수
// ============================================================================

// 고정 폭 포맷이라 문자열 비교가 곧 시간 비교
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_sql_int(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

type RawRow = (String, String, String, String, String, Option<String>);

fn row_to_raw(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn collect_events(
    rows: impl Iterator<Item = rusqlite::Result<RawRow>>,
) -> Result<Vec<AuditEvent>> {
    let mut events = Vec::new();
    for row in rows {
        let (id, timestamp, task_id, action, detail, actor) = row?;

        let action = match action.parse::<AuditAction>() {
            Ok(action) => action,
            Err(e) => {
                warn!(audit_id = %id, error = %e, "Skipping unreadable audit row");
                continue;
            }
        };
        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| crate::Error::Storage(format!("Bad audit timestamp '{}': {}", timestamp, e)))?;
        let detail: Map<String, Value> = serde_json::from_str(&detail)?;

        events.push(AuditEvent {
            id: AuditId(id),
            timestamp,
            task_id,
            action,
            detail,
            actor,
        });
    }
    Ok(events)
}

// ============================================================================
// 테스트
// ============================================================================
