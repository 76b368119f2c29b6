//! Restore engine: schema replay, trigger suspension and block ingestion
//! with per-block type-id mending.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use uuid::Uuid;

use crate::backend::BackendConnection;
use crate::compiler::{
    CompilerPool, DataMendingDesc, DumpBlockDesc, DumpRestoreHeader, DumpTypeInfo,
    RestoreDescriptor,
};
use crate::errors::Error;
use crate::messages::codec::{Incoming, ProtocolVersion, DUMP_VER_MIN, PROTO_VER_CURRENT};
use crate::messages::constants::*;
use crate::messages::server;
use crate::tenant::Tenant;
use crate::view::{DatabaseConnectionView, SideEffect};

use super::core::Connection;

const RESTORE_TIMEOUTS_SQL: &str =
    "SET LOCAL idle_in_transaction_session_timeout = 0; SET LOCAL statement_timeout = 0;";

impl<S, W, T> Connection<S, W, T>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Tenant,
{
    pub(crate) async fn handle_restore(&mut self, mut msg: Incoming) -> Result<(), Error> {
        let headers = msg.get_headers()?;
        if !headers.is_empty() {
            return Err(Error::binary_protocol("unexpected restore request headers"));
        }
        // Parallel-job hint; this server restores single-threaded.
        let _jobs = msg.get_i16()?;

        let header = read_dump_header(&mut msg)?;
        msg.finish()?;

        if self.view.inner.in_tx() {
            return Err(Error::protocol(
                "RESTORE must not be executed while in transaction block",
            ));
        }
        if !self.view.inner.has_state_serializer() {
            self.view.inner.reload_state_serializer()?;
        }

        let tenant = self.tenant.clone();
        let mut be = tenant.acquire_backend(&self.dbname).await?;
        self.in_dump_restore = true;
        let result = match self.restore_with_backend(&mut be, header).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = be.sql_execute("ROLLBACK").await;
                self.view.inner.abort_tx();
                Err(err)
            }
        };
        self.in_dump_restore = false;
        tenant.release_backend(be);
        result?;

        self.view.inner.signal_side_effects(SideEffect::SchemaChanges);
        tenant.trigger_introspection(&self.dbname);

        if self.view.state_desc_changed() {
            self.emit_state_description();
        }
        server::command_complete(
            &mut self.out,
            0,
            "RESTORE",
            self.view.inner.state_type_id(),
            &self.view.inner.serialize_state(),
        );
        self.flush().await
    }

    async fn restore_with_backend(
        &mut self,
        be: &mut T::Backend,
        header: DumpRestoreHeader,
    ) -> Result<(), Error> {
        // Restore starts from a clean session.
        self.view.inner.decode_state(Uuid::nil(), &[])?;

        self.execute_utility_stmt(be, "start transaction isolation serializable")
            .await?;
        be.sql_execute(RESTORE_TIMEOUTS_SQL).await?;

        let tenant = self.tenant.clone();
        let desc = tenant.compiler().describe_database_restore(&header).await?;
        debug!(
            schema_units = desc.units.len(),
            blocks = desc.blocks.len(),
            "restore descriptor ready"
        );

        for unit in &desc.units {
            self.check_cancelled()?;
            if unit.config_ops.iter().any(|op| op.is_instance_scope()) {
                return Err(Error::protocol(
                    "CONFIGURE INSTANCE operations cannot be restored",
                ));
            }
            self.view.inner.start(unit)?;
            let mut unit_result: Result<(), Error> = Ok(());
            if unit.ddl_stmt_id.is_some() {
                unit_result = be.run_ddl(unit, None).await.map(|_| ());
            } else {
                for sql in &unit.sql {
                    if let Err(err) = be.sql_execute(sql).await {
                        unit_result = Err(err);
                        break;
                    }
                }
            }
            match unit_result {
                Ok(()) => self.view.inner.on_success(unit, None),
                Err(err) => {
                    self.view.inner.on_error();
                    return Err(err);
                }
            }
        }

        if !desc.tables_to_disable_triggers.is_empty() {
            let stmt: String = desc
                .tables_to_disable_triggers
                .iter()
                .map(|table| format!("ALTER TABLE {table} DISABLE TRIGGER ALL;"))
                .collect();
            be.sql_execute(&stmt).await?;
        }

        server::restore_ready(&mut self.out, 1);
        self.flush().await?;

        loop {
            let msg = self.reader.wait_for_message().await?;
            match msg.mtype() {
                MSG_RESTORE_BLOCK => self.restore_block(be, &desc, msg).await?,
                MSG_RESTORE_EOF => {
                    msg.finish()?;
                    break;
                }
                other => {
                    return Err(Error::binary_protocol(format!(
                        "unexpected message '{}' during restore",
                        other as char
                    )))
                }
            }
        }

        if !desc.tables_to_disable_triggers.is_empty() {
            let stmt: String = desc
                .tables_to_disable_triggers
                .iter()
                .map(|table| format!("ALTER TABLE {table} ENABLE TRIGGER ALL;"))
                .collect();
            be.sql_execute(&stmt).await?;
        }

        self.execute_utility_stmt(be, "commit").await?;
        Ok(())
    }

    async fn restore_block(
        &mut self,
        be: &mut T::Backend,
        desc: &RestoreDescriptor,
        mut msg: Incoming,
    ) -> Result<(), Error> {
        let headers = msg.get_headers()?;
        msg.finish()?;

        let mut block_type = None;
        let mut block_id = None;
        let mut block_num = None;
        let mut block_data = None;
        for (key, value) in headers {
            match key {
                DUMP_HEADER_BLOCK_TYPE => block_type = Some(value),
                DUMP_HEADER_BLOCK_ID => block_id = Some(value),
                DUMP_HEADER_BLOCK_NUM => block_num = Some(value),
                DUMP_HEADER_BLOCK_DATA => block_data = Some(value),
                _ => {}
            }
        }
        let (Some(_), Some(block_id), Some(_), Some(block_data)) =
            (block_type, block_id, block_num, block_data)
        else {
            return Err(Error::protocol("incomplete data block"));
        };

        let block_id = Uuid::from_slice(&block_id)
            .map_err(|_| Error::binary_protocol("malformed block id"))?;
        let block = desc
            .blocks
            .get(&block_id)
            .ok_or_else(|| Error::protocol(format!("unknown restore block {block_id}")))?;

        let mut type_id_map = HashMap::new();
        if let Some(mending) = &block.data_mending_desc {
            collect_type_id_map(&self.view.inner, mending, &mut type_id_map)?;
        }

        self.check_cancelled()?;
        be.restore(block, &block_data, &type_id_map).await
    }
}

/// Parse the dump-file header embedded in the restore request.
fn read_dump_header(msg: &mut Incoming) -> Result<DumpRestoreHeader, Error> {
    let file_headers = msg.get_headers()?;
    let mut server_version = None;
    let mut catalog_version = None;
    for (key, value) in &file_headers {
        match *key {
            DUMP_HEADER_SERVER_VER => {
                server_version = Some(String::from_utf8_lossy(value).into_owned());
            }
            DUMP_HEADER_SERVER_CATALOG_VERSION => {
                if value.len() == 8 {
                    catalog_version = Some(i64::from_be_bytes(value[..].try_into().unwrap()));
                }
            }
            _ => {}
        }
    }

    let major = msg.get_u16()?;
    let minor = msg.get_u16()?;
    let dump_version = ProtocolVersion::new(major, minor);
    if dump_version < DUMP_VER_MIN || dump_version > PROTO_VER_CURRENT {
        return Err(Error::protocol(format!(
            "unsupported dump version {dump_version}; supported range is \
             {DUMP_VER_MIN} to {PROTO_VER_CURRENT}"
        )));
    }

    let schema_ddl = msg.get_len_bytes()?;

    let ntypes = msg.get_i32()?;
    if ntypes < 0 {
        return Err(Error::binary_protocol("negative type count in dump header"));
    }
    let mut types = Vec::with_capacity(ntypes as usize);
    for _ in 0..ntypes {
        let type_name = msg.get_utf8()?;
        let type_desc = msg.get_utf8()?;
        let type_id = msg.get_uuid()?;
        types.push(DumpTypeInfo {
            type_name,
            type_desc,
            type_id,
        });
    }

    let nblocks = msg.get_i32()?;
    if nblocks < 0 {
        return Err(Error::binary_protocol("negative block count in dump header"));
    }
    let mut blocks = Vec::with_capacity(nblocks as usize);
    for _ in 0..nblocks {
        let schema_object_id = msg.get_uuid()?;
        let type_desc = msg.get_len_bytes()?;
        let ndeps = msg.get_u16()?;
        // Dependencies ordered the blocks at dump time; restore replays in
        // file order, so they are read and discarded.
        for _ in 0..ndeps {
            msg.get_uuid()?;
        }
        blocks.push(DumpBlockDesc {
            schema_object_id,
            type_desc,
            schema_deps: Vec::new(),
        });
    }

    Ok(DumpRestoreHeader {
        server_version,
        catalog_version,
        dump_version,
        schema_ddl,
        types,
        blocks,
    })
}

/// Walk the mending tree, resolving every schema type id that needs its
/// backend representation re-pointed at this database.
fn collect_type_id_map<V: DatabaseConnectionView>(
    view: &V,
    desc: &DataMendingDesc,
    map: &mut HashMap<Uuid, u32>,
) -> Result<(), Error> {
    if desc.needs_mending {
        if let Some(type_id) = desc.schema_type_id {
            if !map.contains_key(&type_id) {
                let backend_id = view.resolve_backend_type_id(type_id)?;
                map.insert(type_id, backend_id);
            }
        }
    }
    for child in &desc.children {
        collect_type_id_map(view, child, map)?;
    }
    Ok(())
}
