//! Transaction control.
//!
//! Nested transactions are implemented with SAVEPOINTs rather than
//! `tokio_postgres::Transaction`'s own nesting, because [`Session`] needs to
//! snapshot and restore its identity map alongside the SQL-level rollback
//! boundary, and `Transaction<'_>` borrows its parent for its whole lifetime
//! which does not compose with a session held across many short-lived calls.
//! Transaction control statements are issued as plain SQL text through
//! [`GenericClient::execute`] rather than by widening that trait.
//!
//! [`Session`]: crate::session::Session

use crate::client::GenericClient;
use crate::error::{OrmError, OrmResult};

/// Tracks transaction nesting depth for one session and names each
/// SAVEPOINT so concurrent nested scopes never collide.
#[derive(Default)]
pub struct TransactionScope {
    depth: u32,
}

impl TransactionScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn savepoint_name(&self) -> String {
        format!("tx_{}", self.depth)
    }

    /// Issues `BEGIN` (outermost) or `SAVEPOINT` (nested) and returns the
    /// name to roll back to or release later.
    pub async fn begin(&mut self, client: &impl GenericClient) -> OrmResult<String> {
        if self.depth == 0 {
            client.execute("BEGIN", &[]).await?;
            self.depth = 1;
            Ok(String::new())
        } else {
            let name = self.savepoint_name();
            client.execute(&format!("SAVEPOINT {name}"), &[]).await?;
            self.depth += 1;
            Ok(name)
        }
    }

    /// Issues `COMMIT` (outermost) or `RELEASE SAVEPOINT` (nested).
    pub async fn commit(&mut self, client: &impl GenericClient, name: &str) -> OrmResult<()> {
        if self.depth == 0 {
            return Err(OrmError::TransactionStateError(
                "commit called with no open transaction".into(),
            ));
        }
        if self.depth == 1 {
            client.execute("COMMIT", &[]).await?;
        } else {
            client
                .execute(&format!("RELEASE SAVEPOINT {name}"), &[])
                .await?;
        }
        self.depth -= 1;
        Ok(())
    }

    /// Issues `ROLLBACK` (outermost) or `ROLLBACK TO SAVEPOINT` (nested).
    pub async fn rollback(&mut self, client: &impl GenericClient, name: &str) -> OrmResult<()> {
        if self.depth == 0 {
            return Err(OrmError::TransactionStateError(
                "rollback called with no open transaction".into(),
            ));
        }
        if self.depth == 1 {
            client.execute("ROLLBACK", &[]).await?;
        } else {
            client
                .execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
                .await?;
        }
        self.depth -= 1;
        Ok(())
    }
}

/// Scoped transaction handle passed to the body closure of
/// [`crate::session::Session::tx`]. Derefs to the enclosing session so
/// ordinary session operations (`get`, `save`, a nested `tx`, ...) run
/// against the same pinned connection and identity map; only `Session::tx`
/// constructs one, so every `begin` this crate issues is paired with exactly
/// one `commit` or `rollback`.
pub struct Tx<'a, C: GenericClient> {
    pub(crate) session: &'a mut crate::session::Session<C>,
}

impl<'a, C: GenericClient> std::ops::Deref for Tx<'a, C> {
    type Target = crate::session::Session<C>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<'a, C: GenericClient> std::ops::DerefMut for Tx<'a, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio_postgres::types::ToSql;

    #[test]
    fn savepoint_names_are_distinct_per_depth() {
        let mut scope = TransactionScope::new();
        scope.depth = 1;
        let a = scope.savepoint_name();
        scope.depth = 2;
        let b = scope.savepoint_name();
        assert_ne!(a, b);
    }

    /// Records every statement it's asked to run rather than talking to a
    /// real backend — enough to verify `TransactionScope` issues the right
    /// SQL in the right order without a database.
    #[derive(Default)]
    struct RecordingClient {
        statements: Mutex<Vec<String>>,
    }

    impl GenericClient for RecordingClient {
        async fn query(&self, sql: &str, _params: &[&(dyn ToSql + Sync)]) -> OrmResult<Vec<tokio_postgres::Row>> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(Vec::new())
        }

        async fn query_one(&self, _sql: &str, _params: &[&(dyn ToSql + Sync)]) -> OrmResult<tokio_postgres::Row> {
            unreachable!("not used by TransactionScope")
        }

        async fn query_opt(
            &self,
            _sql: &str,
            _params: &[&(dyn ToSql + Sync)],
        ) -> OrmResult<Option<tokio_postgres::Row>> {
            unreachable!("not used by TransactionScope")
        }

        async fn execute(&self, sql: &str, _params: &[&(dyn ToSql + Sync)]) -> OrmResult<u64> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(0)
        }
    }

    #[tokio::test]
    async fn begin_commit_at_depth_zero_issues_begin_and_commit() {
        let client = RecordingClient::default();
        let mut scope = TransactionScope::new();
        let name = scope.begin(&client).await.unwrap();
        scope.commit(&client, &name).await.unwrap();
        assert_eq!(*client.statements.lock().unwrap(), vec!["BEGIN", "COMMIT"]);
        assert_eq!(scope.depth(), 0);
    }

    #[tokio::test]
    async fn nested_begin_uses_savepoint_and_release() {
        let client = RecordingClient::default();
        let mut scope = TransactionScope::new();
        let outer = scope.begin(&client).await.unwrap();
        let inner = scope.begin(&client).await.unwrap();
        assert_eq!(inner, "tx_1");
        scope.commit(&client, &inner).await.unwrap();
        scope.commit(&client, &outer).await.unwrap();
        assert_eq!(
            *client.statements.lock().unwrap(),
            vec!["BEGIN", "SAVEPOINT tx_1", "RELEASE SAVEPOINT tx_1", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn rollback_to_savepoint_on_nested_failure() {
        let client = RecordingClient::default();
        let mut scope = TransactionScope::new();
        let outer = scope.begin(&client).await.unwrap();
        let inner = scope.begin(&client).await.unwrap();
        scope.rollback(&client, &inner).await.unwrap();
        scope.commit(&client, &outer).await.unwrap();
        assert_eq!(
            *client.statements.lock().unwrap(),
            vec!["BEGIN", "SAVEPOINT tx_1", "ROLLBACK TO SAVEPOINT tx_1", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn commit_with_no_open_transaction_errors() {
        let client = RecordingClient::default();
        let mut scope = TransactionScope::new();
        let err = scope.commit(&client, "").await.unwrap_err();
        assert!(matches!(err, OrmError::TransactionStateError(_)));
    }
}
