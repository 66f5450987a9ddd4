use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Row, params};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{Database, DbError};

use super::conditions::CategoryFilterType;
use super::plan::{ActionPatch, NewAction, RuleUpsert, UpsertMode, WriteOp, WritePlan};
use super::types::{Action, ActionType, Rule};

const RULE_COLUMNS: &str = "id, user_id, name, automate, run_on_threads, instructions, from_address, to_address, subject, group_id, category_filter_type, created_at, updated_at";
const ACTION_COLUMNS: &str = "a.id, a.rule_id, a.action_type, a.label, a.subject, a.content, a.to_address, a.cc, a.bcc, a.url, a.created_at, a.updated_at";

/// Columns guarded by a per-user unique index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Name,
    GroupId,
}

impl fmt::Display for UniqueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UniqueField::Name => f.write_str("name"),
            UniqueField::GroupId => f.write_str("group_id"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleStoreError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error("action {action_id} not found on rule {rule_id}")]
    ActionNotFound { rule_id: String, action_id: String },
    #[error("unique constraint violated on {0}")]
    UniqueViolation(UniqueField),
    #[error("invalid action type {0}")]
    InvalidActionType(String),
    #[error("invalid category filter type {0}")]
    InvalidCategoryFilterType(String),
}

/// Storage the rule service writes plans to and reads rules from.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn get_rule(&self, user_id: &str, id: &str) -> Result<Rule, RuleStoreError>;

    async fn list_rules(&self, user_id: &str) -> Result<Vec<Rule>, RuleStoreError>;

    /// Apply every op of the plan, or none of them.
    async fn apply_plan(&self, plan: &WritePlan) -> Result<(), RuleStoreError>;

    async fn update_instructions(
        &self,
        user_id: &str,
        id: &str,
        instructions: &str,
    ) -> Result<(), RuleStoreError>;

    async fn delete_rule(&self, user_id: &str, id: &str) -> Result<(), RuleStoreError>;
}

#[derive(Clone)]
pub struct RuleRepository {
    db: Database,
}

impl RuleRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn load_actions(
        &self,
        conn: &Connection,
        filter: RuleFilter<'_>,
    ) -> Result<HashMap<String, Vec<Action>>, RuleStoreError> {
        let mut rows = match filter {
            RuleFilter::Rule(rule_id) => {
                conn.query(
                    &format!(
                        "SELECT {ACTION_COLUMNS}
                         FROM actions a
                         WHERE a.rule_id = ?1
                         ORDER BY a.created_at, a.rowid"
                    ),
                    params![rule_id],
                )
                .await?
            }
            RuleFilter::User(user_id) => {
                conn.query(
                    &format!(
                        "SELECT {ACTION_COLUMNS}
                         FROM actions a
                         JOIN rules r ON r.id = a.rule_id
                         WHERE r.user_id = ?1
                         ORDER BY a.created_at, a.rowid"
                    ),
                    params![user_id],
                )
                .await?
            }
        };

        let mut by_rule: HashMap<String, Vec<Action>> = HashMap::new();
        while let Some(row) = rows.next().await? {
            let action = row_to_action(row)?;
            by_rule
                .entry(action.rule_id.clone())
                .or_default()
                .push(action);
        }
        Ok(by_rule)
    }

    async fn load_category_filters(
        &self,
        conn: &Connection,
        filter: RuleFilter<'_>,
    ) -> Result<HashMap<String, Vec<String>>, RuleStoreError> {
        let mut rows = match filter {
            RuleFilter::Rule(rule_id) => {
                conn.query(
                    "SELECT rule_id, category_id FROM rule_category_filters WHERE rule_id = ?1 ORDER BY rowid",
                    params![rule_id],
                )
                .await?
            }
            RuleFilter::User(user_id) => {
                conn.query(
                    "SELECT f.rule_id, f.category_id
                     FROM rule_category_filters f
                     JOIN rules r ON r.id = f.rule_id
                     WHERE r.user_id = ?1
                     ORDER BY f.rowid",
                    params![user_id],
                )
                .await?
            }
        };

        let mut by_rule: HashMap<String, Vec<String>> = HashMap::new();
        while let Some(row) = rows.next().await? {
            let rule_id: String = row.get(0)?;
            let category_id: String = row.get(1)?;
            by_rule.entry(rule_id).or_default().push(category_id);
        }
        Ok(by_rule)
    }
}

#[derive(Clone, Copy)]
enum RuleFilter<'a> {
    Rule(&'a str),
    User(&'a str),
}

#[async_trait]
impl RuleStore for RuleRepository {
    async fn get_rule(&self, user_id: &str, id: &str) -> Result<Rule, RuleStoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1 AND user_id = ?2"),
                params![id, user_id],
            )
            .await?;

        let mut rule = match rows.next().await? {
            Some(row) => row_to_rule(row)?,
            None => return Err(RuleStoreError::NotFound(id.to_string())),
        };

        let mut actions = self.load_actions(&conn, RuleFilter::Rule(id)).await?;
        let mut filters = self
            .load_category_filters(&conn, RuleFilter::Rule(id))
            .await?;
        rule.actions = actions.remove(id).unwrap_or_default();
        rule.category_filters = filters.remove(id).unwrap_or_default();
        Ok(rule)
    }

    async fn list_rules(&self, user_id: &str) -> Result<Vec<Rule>, RuleStoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS}
                     FROM rules
                     WHERE user_id = ?1
                     ORDER BY created_at, rowid"
                ),
                params![user_id],
            )
            .await?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await? {
            rules.push(row_to_rule(row)?);
        }

        let mut actions = self.load_actions(&conn, RuleFilter::User(user_id)).await?;
        let mut filters = self
            .load_category_filters(&conn, RuleFilter::User(user_id))
            .await?;
        for rule in &mut rules {
            rule.actions = actions.remove(&rule.id).unwrap_or_default();
            rule.category_filters = filters.remove(&rule.id).unwrap_or_default();
        }
        Ok(rules)
    }

    async fn apply_plan(&self, plan: &WritePlan) -> Result<(), RuleStoreError> {
        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;

        match apply_ops(&tx, &plan.ops).await {
            Ok(()) => {
                tx.commit().await?;
                debug!(
                    rule_id = %plan.rule_id,
                    kind = ?plan.kind(),
                    ops = plan.ops.len(),
                    "applied write plan"
                );
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(rule_id = %plan.rule_id, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn update_instructions(
        &self,
        user_id: &str,
        id: &str,
        instructions: &str,
    ) -> Result<(), RuleStoreError> {
        let instructions = Some(instructions).filter(|text| !text.is_empty());
        let conn = self.db.connection().await?;
        let changed = conn
            .execute(
                "UPDATE rules SET instructions = ?1, updated_at = ?2 WHERE id = ?3 AND user_id = ?4",
                params![instructions, now_rfc3339(), id, user_id],
            )
            .await?;

        if changed == 0 {
            return Err(RuleStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_rule(&self, user_id: &str, id: &str) -> Result<(), RuleStoreError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "DELETE FROM rules WHERE id = ?1 AND user_id = ?2 RETURNING id",
                params![id, user_id],
            )
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(RuleStoreError::NotFound(id.to_string())),
        }
    }
}

async fn apply_ops(conn: &Connection, ops: &[WriteOp]) -> Result<(), RuleStoreError> {
    let now = now_rfc3339();
    for op in ops {
        match op {
            WriteOp::UpsertRule(upsert) => upsert_rule(conn, upsert, &now).await?,
            WriteOp::DeleteActions { rule_id, ids } => {
                for id in ids {
                    conn.execute(
                        "DELETE FROM actions WHERE id = ?1 AND rule_id = ?2",
                        params![id.as_str(), rule_id.as_str()],
                    )
                    .await
                    .map_err(classify_sql_error)?;
                }
            }
            WriteOp::UpdateActions { rule_id, patches } => {
                for patch in patches {
                    update_action(conn, rule_id, patch, &now).await?;
                }
            }
            WriteOp::CreateActions { rule_id, actions } => {
                for action in actions {
                    insert_action(conn, rule_id, action, &now).await?;
                }
            }
        }
    }
    Ok(())
}

async fn upsert_rule(
    conn: &Connection,
    upsert: &RuleUpsert,
    now: &str,
) -> Result<(), RuleStoreError> {
    let conditions = &upsert.conditions;
    let filter_type = conditions.category_filter_type.map(|t| t.as_str());

    match upsert.mode {
        UpsertMode::Insert => {
            conn.execute(
                &format!(
                    "INSERT INTO rules ({RULE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)"
                ),
                params![
                    upsert.id.as_str(),
                    upsert.user_id.as_str(),
                    upsert.name.clone().unwrap_or_default(),
                    i64::from(upsert.automate.unwrap_or(false)),
                    i64::from(upsert.run_on_threads.unwrap_or(false)),
                    conditions.instructions.clone(),
                    conditions.from.clone(),
                    conditions.to.clone(),
                    conditions.subject.clone(),
                    conditions.group_id.clone(),
                    filter_type,
                    now
                ],
            )
            .await
            .map_err(classify_sql_error)?;
        }
        UpsertMode::Update => {
            let changed = conn
                .execute(
                    "UPDATE rules
                     SET name = COALESCE(?1, name),
                         automate = COALESCE(?2, automate),
                         run_on_threads = COALESCE(?3, run_on_threads),
                         instructions = ?4,
                         from_address = ?5,
                         to_address = ?6,
                         subject = ?7,
                         group_id = ?8,
                         category_filter_type = ?9,
                         updated_at = ?10
                     WHERE id = ?11 AND user_id = ?12",
                    params![
                        upsert.name.clone(),
                        upsert.automate.map(i64::from),
                        upsert.run_on_threads.map(i64::from),
                        conditions.instructions.clone(),
                        conditions.from.clone(),
                        conditions.to.clone(),
                        conditions.subject.clone(),
                        conditions.group_id.clone(),
                        filter_type,
                        now,
                        upsert.id.as_str(),
                        upsert.user_id.as_str()
                    ],
                )
                .await
                .map_err(classify_sql_error)?;

            if changed == 0 {
                return Err(RuleStoreError::NotFound(upsert.id.clone()));
            }

            conn.execute(
                "DELETE FROM rule_category_filters WHERE rule_id = ?1",
                params![upsert.id.as_str()],
            )
            .await?;
        }
    }

    for category_id in &conditions.category_filters {
        conn.execute(
            "INSERT INTO rule_category_filters (rule_id, category_id) VALUES (?1, ?2)",
            params![upsert.id.as_str(), category_id.as_str()],
        )
        .await
        .map_err(classify_sql_error)?;
    }
    Ok(())
}

async fn update_action(
    conn: &Connection,
    rule_id: &str,
    patch: &ActionPatch,
    now: &str,
) -> Result<(), RuleStoreError> {
    let (set_label, label) = column_patch(&patch.label);
    let (set_subject, subject) = column_patch(&patch.subject);
    let (set_content, content) = column_patch(&patch.content);
    let (set_to, to) = column_patch(&patch.to);
    let (set_cc, cc) = column_patch(&patch.cc);
    let (set_bcc, bcc) = column_patch(&patch.bcc);
    let (set_url, url) = column_patch(&patch.url);

    let changed = conn
        .execute(
            "UPDATE actions
             SET action_type = ?1,
                 label = CASE WHEN ?2 THEN ?3 ELSE label END,
                 subject = CASE WHEN ?4 THEN ?5 ELSE subject END,
                 content = CASE WHEN ?6 THEN ?7 ELSE content END,
                 to_address = CASE WHEN ?8 THEN ?9 ELSE to_address END,
                 cc = CASE WHEN ?10 THEN ?11 ELSE cc END,
                 bcc = CASE WHEN ?12 THEN ?13 ELSE bcc END,
                 url = CASE WHEN ?14 THEN ?15 ELSE url END,
                 updated_at = ?16
             WHERE id = ?17 AND rule_id = ?18",
            params![
                patch.action_type.as_str(),
                set_label,
                label,
                set_subject,
                subject,
                set_content,
                content,
                set_to,
                to,
                set_cc,
                cc,
                set_bcc,
                bcc,
                set_url,
                url,
                now,
                patch.id.as_str(),
                rule_id
            ],
        )
        .await
        .map_err(classify_sql_error)?;

    if changed == 0 {
        return Err(RuleStoreError::ActionNotFound {
            rule_id: rule_id.to_string(),
            action_id: patch.id.clone(),
        });
    }
    Ok(())
}

async fn insert_action(
    conn: &Connection,
    rule_id: &str,
    action: &NewAction,
    now: &str,
) -> Result<(), RuleStoreError> {
    conn.execute(
        "INSERT INTO actions (id, rule_id, action_type, label, subject, content, to_address, cc, bcc, url, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            Uuid::new_v4().to_string(),
            rule_id,
            action.action_type.as_str(),
            action.label.clone(),
            action.subject.clone(),
            action.content.clone(),
            action.to.clone(),
            action.cc.clone(),
            action.bcc.clone(),
            action.url.clone(),
            now
        ],
    )
    .await
    .map_err(classify_sql_error)?;
    Ok(())
}

/// `(write?, value)` for a `CASE WHEN` column update.
fn column_patch(patch: &Option<Option<String>>) -> (i64, Option<String>) {
    (i64::from(patch.is_some()), patch.clone().flatten())
}

fn unique_violation_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)unique constraint failed: (\w+\.\w+(?:,\s*\w+\.\w+)*)").ok()
        })
        .as_ref()
}

/// Which per-user unique index a libsql error tripped, if any.
pub fn unique_violation_field(err: &libsql::Error) -> Option<UniqueField> {
    let message = err.to_string();
    let captures = unique_violation_pattern()?.captures(&message)?;
    let columns: Vec<&str> = captures[1].split(',').map(str::trim).collect();

    if columns.contains(&"rules.name") {
        Some(UniqueField::Name)
    } else if columns.contains(&"rules.group_id") {
        Some(UniqueField::GroupId)
    } else {
        None
    }
}

fn classify_sql_error(err: libsql::Error) -> RuleStoreError {
    match unique_violation_field(&err) {
        Some(field) => RuleStoreError::UniqueViolation(field),
        None => RuleStoreError::Sql(err),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn row_to_rule(row: Row) -> Result<Rule, RuleStoreError> {
    let automate: i64 = row.get(3)?;
    let run_on_threads: i64 = row.get(4)?;
    let category_filter_type: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    let category_filter_type = category_filter_type
        .map(|value| {
            CategoryFilterType::from_str(&value)
                .ok_or(RuleStoreError::InvalidCategoryFilterType(value))
        })
        .transpose()?;

    Ok(Rule {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        automate: automate != 0,
        run_on_threads: run_on_threads != 0,
        instructions: row.get(5)?,
        from: row.get(6)?,
        to: row.get(7)?,
        subject: row.get(8)?,
        group_id: row.get(9)?,
        category_filter_type,
        category_filters: Vec::new(),
        actions: Vec::new(),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_action(row: Row) -> Result<Action, RuleStoreError> {
    let action_type: String = row.get(2)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    let action_type = ActionType::from_str(&action_type)
        .ok_or_else(|| RuleStoreError::InvalidActionType(action_type.clone()))?;

    Ok(Action {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        action_type,
        label: row.get(3)?,
        subject: row.get(4)?,
        content: row.get(5)?,
        to: row.get(6)?,
        cc: row.get(7)?,
        bcc: row.get(8)?,
        url: row.get(9)?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
