use std::sync::Arc;

use log::info;
use rusqlite::{OptionalExtension, Row, params};

use crate::db::Db;
use crate::error::GroupError;
use crate::history::HistoryModel;
use crate::models::{Group, GroupParticipation, ParticipationInfo};

fn row_to_group(row: &Row) -> rusqlite::Result<Group> {
    Ok(Group {
        group_id: row.get(0)?,
        gamespace_id: row.get(1)?,
        group_class: row.get(2)?,
        group_key: row.get(3)?,
        store_messages: row.get::<_, i64>(4)? != 0,
        clustered: row.get::<_, i64>(5)? != 0,
        cluster_size: row.get(6)?,
    })
}

const GROUP_COLUMNS: &str = "group_id, gamespace_id, group_class, group_key, \
     group_store_messages, group_clustered, group_cluster_size";

const PARTICIPATION_COLUMNS: &str = "participation_id, gamespace_id, group_id, \
     participation_account, participation_role, participation_cluster";

fn row_to_participation(row: &Row) -> rusqlite::Result<GroupParticipation> {
    Ok(GroupParticipation {
        participation_id: row.get(0)?,
        gamespace_id: row.get(1)?,
        group_id: row.get(2)?,
        account: row.get(3)?,
        role: row.get(4)?,
        cluster: row.get(5)?,
    })
}

/// The group directory: group identity, participation records, and the
/// `(group, account) → cluster` mapping that bounds fan-out.
pub struct GroupsModel {
    db: Arc<Db>,
    history: Arc<HistoryModel>,
    default_cluster_size: i64,
}

impl GroupsModel {
    pub fn new(db: Arc<Db>, history: Arc<HistoryModel>, default_cluster_size: i64) -> Self {
        GroupsModel {
            db,
            history,
            default_cluster_size,
        }
    }

    pub async fn add_group(
        &self,
        gamespace_id: i64,
        group_class: &str,
        group_key: &str,
        store_messages: bool,
        clustered: bool,
        cluster_size: Option<i64>,
    ) -> Result<i64, GroupError> {
        let cluster_size = cluster_size.unwrap_or(self.default_cluster_size).max(1);
        let conn = self.db.conn.lock().await;
        match conn.execute(
            "INSERT INTO groups (gamespace_id, group_class, group_key, \
                 group_store_messages, group_clustered, group_cluster_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                gamespace_id,
                group_class,
                group_key,
                store_messages as i64,
                clustered as i64,
                cluster_size
            ],
        ) {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if e.to_string().contains("UNIQUE") => Err(GroupError::AlreadyExists),
            Err(e) => Err(GroupError::Storage(e)),
        }
    }

    pub async fn find_group(
        &self,
        gamespace_id: i64,
        group_class: &str,
        group_key: &str,
    ) -> Result<Group, GroupError> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {GROUP_COLUMNS} FROM groups \
                 WHERE gamespace_id = ?1 AND group_class = ?2 AND group_key = ?3"
            ),
            params![gamespace_id, group_class, group_key],
            row_to_group,
        )
        .optional()?
        .ok_or(GroupError::GroupNotFound)
    }

    /// Join `account` into the group, assigning a cluster for clustered
    /// groups: the lowest cluster with free capacity, else a fresh one.
    pub async fn join_group(
        &self,
        group: &Group,
        account: &str,
        role: &str,
    ) -> Result<GroupParticipation, GroupError> {
        let conn = self.db.conn.lock().await;
        conn.execute_batch("BEGIN IMMEDIATE;")?;

        let outcome: Result<GroupParticipation, GroupError> = (|| {
            let cluster = if group.clustered {
                let open: Option<i64> = conn
                    .query_row(
                        "SELECT cluster_id FROM group_clusters \
                         WHERE gamespace_id = ?1 AND group_id = ?2 AND cluster_accounts < ?3 \
                         ORDER BY cluster_id LIMIT 1",
                        params![group.gamespace_id, group.group_id, group.cluster_size],
                        |row| row.get(0),
                    )
                    .optional()?;
                match open {
                    Some(cluster_id) => {
                        conn.execute(
                            "UPDATE group_clusters SET cluster_accounts = cluster_accounts + 1 \
                             WHERE gamespace_id = ?1 AND group_id = ?2 AND cluster_id = ?3",
                            params![group.gamespace_id, group.group_id, cluster_id],
                        )?;
                        cluster_id
                    }
                    None => {
                        let next: i64 = conn.query_row(
                            "SELECT COALESCE(MAX(cluster_id) + 1, 0) FROM group_clusters \
                             WHERE gamespace_id = ?1 AND group_id = ?2",
                            params![group.gamespace_id, group.group_id],
                            |row| row.get(0),
                        )?;
                        conn.execute(
                            "INSERT INTO group_clusters \
                                 (gamespace_id, group_id, cluster_id, cluster_accounts)
                             VALUES (?1, ?2, ?3, 1)",
                            params![group.gamespace_id, group.group_id, next],
                        )?;
                        next
                    }
                }
            } else {
                0
            };

            match conn.execute(
                "INSERT INTO group_participants (gamespace_id, group_id, \
                     participation_account, participation_role, participation_cluster)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![group.gamespace_id, group.group_id, account, role, cluster],
            ) {
                Ok(_) => {}
                Err(e) if e.to_string().contains("UNIQUE") => {
                    return Err(GroupError::AlreadyJoined);
                }
                Err(e) => return Err(GroupError::Storage(e)),
            }

            Ok(GroupParticipation {
                participation_id: conn.last_insert_rowid(),
                gamespace_id: group.gamespace_id,
                group_id: group.group_id,
                account: account.to_string(),
                role: role.to_string(),
                cluster,
            })
        })();

        match outcome {
            Ok(participation) => {
                conn.execute_batch("COMMIT;")?;
                info!(
                    "Account {} joined group {} (cluster {})",
                    account, group.group_id, participation.cluster
                );
                Ok(participation)
            }
            Err(e) => {
                conn.execute_batch("ROLLBACK;").ok();
                Err(e)
            }
        }
    }

    pub async fn leave_group(&self, group: &Group, account: &str) -> Result<(), GroupError> {
        let conn = self.db.conn.lock().await;
        let cluster: Option<i64> = conn
            .query_row(
                "SELECT participation_cluster FROM group_participants \
                 WHERE gamespace_id = ?1 AND group_id = ?2 AND participation_account = ?3",
                params![group.gamespace_id, group.group_id, account],
                |row| row.get(0),
            )
            .optional()?;
        let Some(cluster) = cluster else {
            return Err(GroupError::ParticipantNotFound);
        };
        conn.execute(
            "DELETE FROM group_participants \
             WHERE gamespace_id = ?1 AND group_id = ?2 AND participation_account = ?3",
            params![group.gamespace_id, group.group_id, account],
        )?;
        if group.clustered {
            conn.execute(
                "UPDATE group_clusters \
                 SET cluster_accounts = MAX(cluster_accounts - 1, 0) \
                 WHERE gamespace_id = ?1 AND group_id = ?2 AND cluster_id = ?3",
                params![group.gamespace_id, group.group_id, cluster],
            )?;
        }
        Ok(())
    }

    pub async fn find_group_participant(
        &self,
        gamespace_id: i64,
        group_id: i64,
        account: &str,
    ) -> Result<GroupParticipation, GroupError> {
        let conn = self.db.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {PARTICIPATION_COLUMNS} FROM group_participants \
                 WHERE gamespace_id = ?1 AND group_id = ?2 AND participation_account = ?3"
            ),
            params![gamespace_id, group_id, account],
            row_to_participation,
        )
        .optional()?
        .ok_or(GroupError::ParticipantNotFound)
    }

    /// Every group the account participates in, with its participation.
    /// This is what a conversation binds on attach.
    pub async fn list_participations_by_account(
        &self,
        gamespace_id: i64,
        account: &str,
    ) -> Result<Vec<ParticipationInfo>, GroupError> {
        let conn = self.db.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT g.group_id, g.gamespace_id, g.group_class, g.group_key, \
                 g.group_store_messages, g.group_clustered, g.group_cluster_size, \
                 p.participation_id, p.participation_account, p.participation_role, \
                 p.participation_cluster \
             FROM group_participants p \
             JOIN groups g ON g.group_id = p.group_id AND g.gamespace_id = p.gamespace_id \
             WHERE p.gamespace_id = ?1 AND p.participation_account = ?2",
        )?;
        let participations = stmt
            .query_map(params![gamespace_id, account], |row| {
                let group = row_to_group(row)?;
                let participation = GroupParticipation {
                    participation_id: row.get(7)?,
                    gamespace_id: group.gamespace_id,
                    group_id: group.group_id,
                    account: row.get(8)?,
                    role: row.get(9)?,
                    cluster: row.get(10)?,
                };
                Ok(ParticipationInfo {
                    group,
                    participation,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(participations)
    }

    /// Delete a group: its message history (every cluster key), clusters,
    /// and participations go with it.
    pub async fn delete_group(&self, group: &Group) -> Result<(), GroupError> {
        if group.clustered {
            self.history
                .delete_messages_like(
                    group.gamespace_id,
                    &group.group_class,
                    &format!("{}-%", group.group_id),
                )
                .await?;
        } else {
            self.history
                .delete_messages(
                    group.gamespace_id,
                    &group.group_class,
                    &group.group_id.to_string(),
                )
                .await?;
        }

        let conn = self.db.conn.lock().await;
        conn.execute(
            "DELETE FROM groups WHERE gamespace_id = ?1 AND group_id = ?2",
            params![group.gamespace_id, group.group_id],
        )?;
        info!("Deleted group {} and its history", group.group_id);
        Ok(())
    }
}
