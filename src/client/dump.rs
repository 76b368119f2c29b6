//! Dump engine: a serializable snapshot of the database streamed to the
//! client as a schema header plus data blocks.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{BackendConnection, DumpChunk};
use crate::compiler::{CompilerPool, DumpDescriptor};
use crate::errors::Error;
use crate::messages::codec::{Incoming, PROTO_VER_CURRENT};
use crate::messages::constants::HEADER_DUMP_SECRETS;
use crate::messages::server;
use crate::tenant::Tenant;
use crate::view::DatabaseConnectionView;

use super::core::Connection;

const DUMP_SNAPSHOT_SQL: &str = "START TRANSACTION ISOLATION LEVEL SERIALIZABLE \
     READ ONLY DEFERRABLE; \
     SET LOCAL idle_in_transaction_session_timeout = 0; \
     SET LOCAL statement_timeout = 0;";

impl<S, W, T> Connection<S, W, T>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Tenant,
{
    pub(crate) async fn handle_dump(&mut self, mut msg: Incoming) -> Result<(), Error> {
        let headers = msg.get_headers()?;
        msg.finish()?;
        let include_secrets = headers
            .iter()
            .any(|(key, value)| *key == HEADER_DUMP_SECRETS && value.first() == Some(&1));

        if self.view.inner.in_tx() {
            return Err(Error::protocol(
                "DUMP must not be executed while in transaction block",
            ));
        }
        self.check_cancelled()?;

        let tenant = self.tenant.clone();
        let be = tenant.acquire_backend(&self.dbname).await?;
        self.in_dump_restore = true;
        let result = self.dump_with_backend(be, include_secrets).await;
        self.in_dump_restore = false;
        result
    }

    async fn dump_with_backend(
        &mut self,
        mut be: T::Backend,
        include_secrets: bool,
    ) -> Result<(), Error> {
        let tenant = self.tenant.clone();

        let desc = match self.dump_prepare(&mut be, include_secrets).await {
            Ok(desc) => desc,
            Err(err) => {
                let _ = be.sql_execute("ROLLBACK").await;
                tenant.release_backend(be);
                return Err(err);
            }
        };
        debug!(blocks = desc.blocks.len(), "dump header sent");

        // The producer owns the backend connection for the duration of the
        // stream and hands it back through the join handle. The bounded
        // queue provides backpressure; dropping the receiver tells a
        // blocked producer to stop.
        let (chunk_tx, mut chunk_rx) =
            mpsc::channel::<DumpChunk>(self.config.dump_queue_depth.max(1));
        let blocks = desc.blocks.clone();
        let cancelled = self.cancelled.clone();
        let producer = tokio::spawn(async move {
            let result = be.dump(blocks, chunk_tx, cancelled).await;
            (be, result)
        });

        let mut consume_result: Result<(), Error> = Ok(());
        loop {
            if let Err(err) = self.check_cancelled() {
                consume_result = Err(err);
                break;
            }
            // Sender drop is the end-of-stream sentinel; a single
            // producer is assumed.
            let Some(chunk) = chunk_rx.recv().await else {
                break;
            };
            let Some(block) = desc.blocks.get(chunk.block_index) else {
                consume_result = Err(Error::internal("dump chunk for an unknown block"));
                break;
            };
            server::dump_block(
                &mut self.out,
                block.schema_object_id,
                chunk.block_num,
                &chunk.data,
            );
            if let Err(err) = self.maybe_flush().await {
                consume_result = Err(err);
                break;
            }
        }
        drop(chunk_rx);

        let (mut be, produce_result) = match producer.await {
            Ok(pair) => pair,
            Err(join_err) => {
                return Err(Error::internal(format!("dump producer panicked: {join_err}")))
            }
        };
        let rollback_result = be.sql_execute("ROLLBACK").await;
        tenant.release_backend(be);

        consume_result?;
        produce_result?;
        rollback_result?;

        server::command_complete(&mut self.out, 0, "DUMP", Uuid::nil(), &[]);
        self.flush().await
    }

    /// Open the snapshot, introspect, get the descriptor from the
    /// compiler and send the `@` header.
    async fn dump_prepare(
        &mut self,
        be: &mut T::Backend,
        include_secrets: bool,
    ) -> Result<DumpDescriptor, Error> {
        be.sql_execute(DUMP_SNAPSHOT_SQL).await?;

        let user_schema = be.user_schema_json().await?;
        let global_schema = be.global_schema_json().await?;
        let db_config = be.db_config_json(include_secrets).await?;

        let tenant = self.tenant.clone();
        // Dump files are always written at the newest protocol the server
        // supports, whatever the connection negotiated.
        let desc = tenant
            .compiler()
            .describe_database_dump(&user_schema, &global_schema, &db_config, PROTO_VER_CURRENT)
            .await?;

        let mut schema_ddl = desc.schema_ddl.clone();
        for ddl in &desc.dynamic_ddl {
            if let Some(value) = be.sql_fetch_val(ddl).await? {
                let text = std::str::from_utf8(&value)
                    .map_err(|_| Error::internal("dynamic DDL produced non-UTF-8 output"))?;
                schema_ddl.push('\n');
                schema_ddl.push_str(text);
            }
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        server::dump_header(
            &mut self.out,
            tenant.server_version_string(),
            tenant.catalog_version(),
            now,
            PROTO_VER_CURRENT,
            schema_ddl.as_bytes(),
            &desc.types,
            &desc.blocks,
        );
        self.flush().await?;
        Ok(desc)
    }
}
