//! Query helpers for the relational store.
//!
//! These operate on a single `rusqlite::Connection` (as borrowed from a
//! [`crate::DatabasePool`]) rather than owning a pool themselves, so callers
//! control transaction boundaries.

use crate::models::{
    DealerAccount, Operation, OperationStatus, OperationType, ResponseData, Transaction,
    TransactionKind,
};
use crate::{DatabaseError, DatabaseResult};
use rusqlite::{params, Connection, OptionalExtension, Row};

fn row_to_account(row: &Row) -> rusqlite::Result<DealerAccount> {
    Ok(DealerAccount {
        id: row.get("id")?,
        username: row.get("username")?,
        password: row.get("password")?,
        totp_seed: row.get("totp_seed")?,
        proxy_id: row.get("proxy_id")?,
        active: row.get::<_, i64>("active")? != 0,
        priority: row.get("priority")?,
        last_known_balance: row.get("last_known_balance")?,
        balance_updated_at: row.get("balance_updated_at")?,
        cooldown_until: row.get("cooldown_until")?,
        fail_reason: row.get("fail_reason")?,
        last_used_at: row.get("last_used_at")?,
    })
}

pub fn get_dealer_account(conn: &Connection, id: &str) -> DatabaseResult<Option<DealerAccount>> {
    conn.query_row(
        "SELECT * FROM dealer_accounts WHERE id = ?1",
        params![id],
        row_to_account,
    )
    .optional()
    .map_err(DatabaseError::from)
}

/// All active accounts, highest priority first, ties broken by oldest
/// last-used — the same ordering the Account Pool uses to pick a candidate.
pub fn list_active_accounts_by_priority(conn: &Connection) -> DatabaseResult<Vec<DealerAccount>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM dealer_accounts
         WHERE active = 1
         ORDER BY priority DESC, last_used_at ASC",
    )?;
    let rows = stmt.query_map([], row_to_account)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn insert_dealer_account(conn: &Connection, account: &DealerAccount) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO dealer_accounts
            (id, username, password, totp_seed, proxy_id, active, priority,
             last_known_balance, balance_updated_at, cooldown_until, fail_reason, last_used_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            account.id,
            account.username,
            account.password,
            account.totp_seed,
            account.proxy_id,
            account.active as i64,
            account.priority,
            account.last_known_balance,
            account.balance_updated_at,
            account.cooldown_until,
            account.fail_reason,
            account.last_used_at,
        ],
    )?;
    Ok(())
}

pub fn update_account_balance(
    conn: &Connection,
    id: &str,
    balance: f64,
    now: i64,
) -> DatabaseResult<()> {
    conn.execute(
        "UPDATE dealer_accounts SET last_known_balance = ?1, balance_updated_at = ?2 WHERE id = ?3",
        params![balance, now, id],
    )?;
    Ok(())
}

pub fn set_account_cooldown(
    conn: &Connection,
    id: &str,
    until: i64,
    reason: &str,
) -> DatabaseResult<()> {
    conn.execute(
        "UPDATE dealer_accounts SET cooldown_until = ?1, fail_reason = ?2 WHERE id = ?3",
        params![until, reason, id],
    )?;
    Ok(())
}

pub fn mark_account_used(conn: &Connection, id: &str, now: i64) -> DatabaseResult<()> {
    conn.execute(
        "UPDATE dealer_accounts SET last_used_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    Ok(())
}

fn row_to_operation(row: &Row) -> rusqlite::Result<Operation> {
    let op_type_str: String = row.get("op_type")?;
    let status_str: String = row.get("status")?;
    let response_data_str: Option<String> = row.get("response_data")?;
    let response_data = response_data_str
        .map(|s| serde_json::from_str::<ResponseData>(&s))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;

    Ok(Operation {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        op_type: OperationType::from_str(&op_type_str).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(0, "op_type".into(), rusqlite::types::Type::Text)
        })?,
        status: OperationStatus::from_str(&status_str).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(0, "status".into(), rusqlite::types::Type::Text)
        })?,
        card_number: row.get("card_number")?,
        account_id: row.get("account_id")?,
        amount: row.get("amount")?,
        selected_package: row.get("selected_package")?,
        stb_number: row.get("stb_number")?,
        captcha_image: row.get("captcha_image")?,
        captcha_solution: row.get("captcha_solution")?,
        response_data,
        response_message: row.get("response_message")?,
        heartbeat_at: row.get("heartbeat_at")?,
        heartbeat_expiry: row.get("heartbeat_expiry")?,
        final_confirm_expiry: row.get("final_confirm_expiry")?,
        completed_at: row.get("completed_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn get_operation(conn: &Connection, id: &str) -> DatabaseResult<Option<Operation>> {
    conn.query_row(
        "SELECT * FROM operations WHERE id = ?1",
        params![id],
        row_to_operation,
    )
    .optional()
    .map_err(DatabaseError::from)
}

pub fn insert_operation(conn: &Connection, op: &Operation) -> DatabaseResult<()> {
    let response_data = op
        .response_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO operations
            (id, user_id, op_type, status, card_number, account_id, amount,
             selected_package, stb_number, captcha_image, captcha_solution,
             response_data, response_message, heartbeat_at, heartbeat_expiry,
             final_confirm_expiry, completed_at, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
        params![
            op.id,
            op.user_id,
            op.op_type.as_str(),
            op.status.as_str(),
            op.card_number,
            op.account_id,
            op.amount,
            op.selected_package,
            op.stb_number,
            op.captcha_image,
            op.captcha_solution,
            response_data,
            op.response_message,
            op.heartbeat_at,
            op.heartbeat_expiry,
            op.final_confirm_expiry,
            op.completed_at,
            op.created_at,
            op.updated_at,
        ],
    )?;
    Ok(())
}

/// Conditional status update gated on the expected prior status — the
/// mechanism the design notes call for instead of mutable cross-handler
/// fields. Returns `Ok(true)` if the row matched and was updated,
/// `Ok(false)` if the row was not in `expected` (a stale or duplicate
/// delivery, or a concurrent winner already moved it on).
pub fn update_status_if(
    conn: &Connection,
    operation_id: &str,
    expected: OperationStatus,
    new_status: OperationStatus,
    now: i64,
) -> DatabaseResult<bool> {
    let rows = conn.execute(
        "UPDATE operations SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![new_status.as_str(), now, operation_id, expected.as_str()],
    )?;
    Ok(rows == 1)
}

/// Full-row update used by handlers writing several fields at once, e.g.
/// the transition to `AWAITING_PACKAGE` at the end of `START_RENEWAL`.
/// Still gated on `expected` to preserve the "conditional update" invariant.
#[allow(clippy::too_many_arguments)]
pub fn update_operation_if(
    conn: &Connection,
    operation_id: &str,
    expected: OperationStatus,
    new_status: OperationStatus,
    account_id: Option<&str>,
    amount: Option<f64>,
    response_data: Option<&ResponseData>,
    response_message: Option<&str>,
    final_confirm_expiry: Option<i64>,
    heartbeat_expiry: Option<i64>,
    completed_at: Option<i64>,
    now: i64,
) -> DatabaseResult<bool> {
    let response_data_str = response_data.map(serde_json::to_string).transpose()?;
    let rows = conn.execute(
        "UPDATE operations SET
            status = ?1,
            account_id = COALESCE(?2, account_id),
            amount = COALESCE(?3, amount),
            response_data = COALESCE(?4, response_data),
            response_message = COALESCE(?5, response_message),
            final_confirm_expiry = COALESCE(?6, final_confirm_expiry),
            heartbeat_expiry = COALESCE(?7, heartbeat_expiry),
            completed_at = COALESCE(?8, completed_at),
            updated_at = ?9
         WHERE id = ?10 AND status = ?11",
        params![
            new_status.as_str(),
            account_id,
            amount,
            response_data_str,
            response_message,
            final_confirm_expiry,
            heartbeat_expiry,
            completed_at,
            now,
            operation_id,
            expected.as_str(),
        ],
    )?;
    Ok(rows == 1)
}

/// Pause an operation at `AWAITING_CAPTCHA` with the challenge image and a
/// fresh heartbeat deadline. The 120-s CAPTCHA-wait deadline itself is not
/// a separate column: callers derive it from `updated_at + 120s`, since
/// this write always sets `updated_at = now`.
pub fn set_awaiting_captcha(
    conn: &Connection,
    operation_id: &str,
    expected: OperationStatus,
    captcha_image: &str,
    heartbeat_expiry: i64,
    now: i64,
) -> DatabaseResult<bool> {
    let rows = conn.execute(
        "UPDATE operations SET
            status = ?1,
            captcha_image = ?2,
            captcha_solution = NULL,
            heartbeat_expiry = ?3,
            updated_at = ?4
         WHERE id = ?5 AND status = ?6",
        params![
            OperationStatus::AwaitingCaptcha.as_str(),
            captcha_image,
            heartbeat_expiry,
            now,
            operation_id,
            expected.as_str(),
        ],
    )?;
    Ok(rows == 1)
}

/// Record a human-supplied CAPTCHA solution for an operation currently
/// paused at `AWAITING_CAPTCHA`.
pub fn set_captcha_solution(conn: &Connection, operation_id: &str, solution: &str) -> DatabaseResult<bool> {
    let rows = conn.execute(
        "UPDATE operations SET captcha_solution = ?1 WHERE id = ?2 AND status = ?3",
        params![solution, operation_id, OperationStatus::AwaitingCaptcha.as_str()],
    )?;
    Ok(rows == 1)
}

/// Read back just the CAPTCHA solution (and whether it has arrived yet),
/// used by the CAPTCHA-solution polling loop.
pub fn get_captcha_solution(conn: &Connection, operation_id: &str) -> DatabaseResult<Option<String>> {
    let solution: Option<Option<String>> = conn
        .query_row(
            "SELECT captcha_solution FROM operations WHERE id = ?1",
            params![operation_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(solution.flatten())
}

pub fn clear_captcha_fields(conn: &Connection, operation_id: &str) -> DatabaseResult<()> {
    conn.execute(
        "UPDATE operations SET captcha_image = NULL, captcha_solution = NULL WHERE id = ?1",
        params![operation_id],
    )?;
    Ok(())
}

pub fn is_cancelled(conn: &Connection, operation_id: &str) -> DatabaseResult<bool> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM operations WHERE id = ?1",
            params![operation_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status.as_deref() == Some(OperationStatus::Cancelled.as_str()))
}

pub fn insert_transaction(conn: &Connection, tx: &Transaction) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO transactions (id, operation_id, user_id, kind, amount, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            tx.id,
            tx.operation_id,
            tx.user_id,
            tx.kind.as_str(),
            tx.amount,
            tx.created_at,
        ],
    )?;
    Ok(())
}

/// Sum of transactions of a given kind referencing an operation; used to
/// check P1 (no double refund) and P7 (installment safety) in tests.
pub fn sum_transactions(
    conn: &Connection,
    operation_id: &str,
    kind: TransactionKind,
) -> DatabaseResult<f64> {
    let sum: Option<f64> = conn.query_row(
        "SELECT SUM(amount) FROM transactions WHERE operation_id = ?1 AND kind = ?2",
        params![operation_id, kind.as_str()],
        |row| row.get(0),
    )?;
    Ok(sum.unwrap_or(0.0))
}

/// A user's current balance, derived from the append-only transaction
/// ledger rather than stored redundantly: deposits, refunds, and
/// corrections credit; withdrawals and operation deductions debit.
pub fn get_user_balance(conn: &Connection, user_id: &str) -> DatabaseResult<f64> {
    let balance: Option<f64> = conn.query_row(
        "SELECT SUM(
            CASE kind
                WHEN 'DEPOSIT' THEN amount
                WHEN 'REFUND' THEN amount
                WHEN 'CORRECTION' THEN amount
                WHEN 'WITHDRAW' THEN -amount
                WHEN 'OPERATION_DEDUCT' THEN -amount
                ELSE 0
            END
         ) FROM transactions WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(balance.unwrap_or(0.0))
}

/// Whether any transaction of `kind` already references this operation —
/// the idempotency check the refund adapter uses so a duplicate job
/// delivery never applies the same debit or refund twice.
pub fn has_transaction_kind(
    conn: &Connection,
    operation_id: &str,
    kind: TransactionKind,
) -> DatabaseResult<bool> {
    Ok(sum_transactions(conn, operation_id, kind)? > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn sample_account(id: &str) -> DealerAccount {
        DealerAccount {
            id: id.into(),
            username: "user".into(),
            password: "pass".into(),
            totp_seed: None,
            proxy_id: None,
            active: true,
            priority: 0,
            last_known_balance: Some(100.0),
            balance_updated_at: None,
            cooldown_until: 0,
            fail_reason: None,
            last_used_at: 0,
        }
    }

    fn sample_operation(id: &str) -> Operation {
        Operation {
            id: id.into(),
            user_id: "u1".into(),
            op_type: OperationType::StartRenewal,
            status: OperationStatus::Pending,
            card_number: "1234567890".into(),
            account_id: None,
            amount: 0.0,
            selected_package: None,
            stb_number: None,
            captcha_image: None,
            captcha_solution: None,
            response_data: None,
            response_message: None,
            heartbeat_at: None,
            heartbeat_expiry: None,
            final_confirm_expiry: None,
            completed_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn account_round_trips() {
        let conn = test_conn();
        insert_dealer_account(&conn, &sample_account("a1")).unwrap();
        let fetched = get_dealer_account(&conn, "a1").unwrap().unwrap();
        assert_eq!(fetched.username, "user");
        assert_eq!(fetched.last_known_balance, Some(100.0));
    }

    #[test]
    fn list_active_accounts_orders_by_priority_then_last_used() {
        let conn = test_conn();
        let mut low = sample_account("low");
        low.priority = 1;
        low.last_used_at = 100;
        let mut high = sample_account("high");
        high.priority = 5;
        let mut inactive = sample_account("inactive");
        inactive.active = false;

        insert_dealer_account(&conn, &low).unwrap();
        insert_dealer_account(&conn, &high).unwrap();
        insert_dealer_account(&conn, &inactive).unwrap();

        let accounts = list_active_accounts_by_priority(&conn).unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].id, "high");
        assert_eq!(accounts[1].id, "low");
    }

    #[test]
    fn update_status_if_rejects_stale_expectation() {
        let conn = test_conn();
        insert_operation(&conn, &sample_operation("op1")).unwrap();

        let ok = update_status_if(
            &conn,
            "op1",
            OperationStatus::Pending,
            OperationStatus::Processing,
            1,
        )
        .unwrap();
        assert!(ok);

        // Second attempt still expecting Pending must be rejected: the row
        // is now Processing. This is the duplicate-delivery guard.
        let rejected = update_status_if(
            &conn,
            "op1",
            OperationStatus::Pending,
            OperationStatus::Processing,
            2,
        )
        .unwrap();
        assert!(!rejected);
    }

    #[test]
    fn terminal_status_cannot_be_revived_by_duplicate_update() {
        let conn = test_conn();
        insert_operation(&conn, &sample_operation("op2")).unwrap();
        update_status_if(
            &conn,
            "op2",
            OperationStatus::Pending,
            OperationStatus::Completed,
            1,
        )
        .unwrap();

        let revived = update_status_if(
            &conn,
            "op2",
            OperationStatus::AwaitingFinalConfirm,
            OperationStatus::Completed,
            2,
        )
        .unwrap();
        assert!(!revived);

        let op = get_operation(&conn, "op2").unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
    }

    #[test]
    fn transaction_sums_support_p1_and_p7_checks() {
        let conn = test_conn();
        insert_operation(&conn, &sample_operation("op3")).unwrap();
        insert_transaction(
            &conn,
            &Transaction {
                id: "t1".into(),
                operation_id: "op3".into(),
                user_id: "u1".into(),
                kind: TransactionKind::OperationDeduct,
                amount: 50.0,
                created_at: 1,
            },
        )
        .unwrap();
        insert_transaction(
            &conn,
            &Transaction {
                id: "t2".into(),
                operation_id: "op3".into(),
                user_id: "u1".into(),
                kind: TransactionKind::Refund,
                amount: 50.0,
                created_at: 2,
            },
        )
        .unwrap();

        let deducted = sum_transactions(&conn, "op3", TransactionKind::OperationDeduct).unwrap();
        let refunded = sum_transactions(&conn, "op3", TransactionKind::Refund).unwrap();
        assert!(refunded <= deducted);
    }

    #[test]
    fn user_balance_nets_credits_and_debits() {
        let conn = test_conn();
        insert_operation(&conn, &sample_operation("op4")).unwrap();
        for (kind, amount) in [
            (TransactionKind::Deposit, 100.0),
            (TransactionKind::OperationDeduct, 50.0),
            (TransactionKind::Refund, 20.0),
        ] {
            insert_transaction(
                &conn,
                &Transaction {
                    id: format!("t-{}", kind.as_str()),
                    operation_id: "op4".into(),
                    user_id: "u1".into(),
                    kind,
                    amount,
                    created_at: 1,
                },
            )
            .unwrap();
        }

        assert_eq!(get_user_balance(&conn, "u1").unwrap(), 70.0);
        assert_eq!(get_user_balance(&conn, "nobody").unwrap(), 0.0);
    }

    #[test]
    fn set_awaiting_captcha_pauses_and_poll_sees_the_solution() {
        let conn = test_conn();
        insert_operation(&conn, &sample_operation("op6")).unwrap();
        update_status_if(&conn, "op6", OperationStatus::Pending, OperationStatus::Processing, 1).unwrap();

        let paused = set_awaiting_captcha(&conn, "op6", OperationStatus::Processing, "img-data", 200, 100).unwrap();
        assert!(paused);
        assert!(get_captcha_solution(&conn, "op6").unwrap().is_none());

        let solved = set_captcha_solution(&conn, "op6", "ABCD").unwrap();
        assert!(solved);
        assert_eq!(get_captcha_solution(&conn, "op6").unwrap().as_deref(), Some("ABCD"));

        clear_captcha_fields(&conn, "op6").unwrap();
        assert!(get_captcha_solution(&conn, "op6").unwrap().is_none());
        let op = get_operation(&conn, "op6").unwrap().unwrap();
        assert!(op.captcha_image.is_none());
    }

    #[test]
    fn set_awaiting_captcha_rejects_stale_expectation() {
        let conn = test_conn();
        insert_operation(&conn, &sample_operation("op7")).unwrap();
        let rejected =
            set_awaiting_captcha(&conn, "op7", OperationStatus::Processing, "img", 200, 100).unwrap();
        assert!(!rejected);
    }

    #[test]
    fn set_captcha_solution_rejected_outside_awaiting_captcha() {
        let conn = test_conn();
        insert_operation(&conn, &sample_operation("op8")).unwrap();
        let rejected = set_captcha_solution(&conn, "op8", "ABCD").unwrap();
        assert!(!rejected);
    }

    #[test]
    fn has_transaction_kind_detects_existing_refund() {
        let conn = test_conn();
        insert_operation(&conn, &sample_operation("op5")).unwrap();
        assert!(!has_transaction_kind(&conn, "op5", TransactionKind::Refund).unwrap());
        insert_transaction(
            &conn,
            &Transaction {
                id: "t1".into(),
                operation_id: "op5".into(),
                user_id: "u1".into(),
                kind: TransactionKind::Refund,
                amount: 10.0,
                created_at: 1,
            },
        )
        .unwrap();
        assert!(has_transaction_kind(&conn, "op5", TransactionKind::Refund).unwrap());
    }
}
