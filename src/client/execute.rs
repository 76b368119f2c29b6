//! The parse/execute engine.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{BackendConnection, BatchFence, ExecuteParams, NewTypes};
use crate::compiler::{
    capability, recode_bind_args, CompiledQuery, CompilerPool, ConfigOp, OutputFormat,
    QueryRequestInfo, QueryUnit,
};
use crate::errors::{Error, ErrorKind};
use crate::messages::codec::Incoming;
use crate::messages::constants::*;
use crate::messages::server;
use crate::tenant::Tenant;
use crate::view::{unit_side_effect, DatabaseConnectionView, SideEffect};

use super::core::Connection;

/// Decoded `ParseExecuteRequest` prefix shared by Parse and Execute.
pub(crate) struct ParseExecuteRequest {
    pub req: QueryRequestInfo,
    pub state_tid: Uuid,
    pub state_data: Bytes,
}

impl<S, W, T> Connection<S, W, T>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: Tenant,
{
    fn read_request(&self, msg: &mut Incoming) -> Result<ParseExecuteRequest, Error> {
        msg.skip_annotations()?;
        let allow_capabilities = msg.get_u64()?;
        let compilation_flags = msg.get_u64()?;
        let implicit_limit = msg.get_i64()?;
        if implicit_limit < 0 {
            return Err(Error::binary_protocol(format!(
                "implicit limit must not be negative, got {implicit_limit}"
            )));
        }
        let output_format = OutputFormat::from_byte(msg.get_u8()?)?;
        let expect_one = match msg.get_u8()? {
            CARDINALITY_AT_MOST_ONE => true,
            CARDINALITY_MANY => false,
            other => {
                return Err(Error::binary_protocol(format!(
                    "unknown expected cardinality: {other:#04x}"
                )))
            }
        };
        let source = msg.get_utf8()?;
        if source.is_empty() {
            return Err(Error::binary_protocol("empty query"));
        }
        let state_tid = msg.get_uuid()?;
        let state_data = msg.get_len_bytes()?;

        Ok(ParseExecuteRequest {
            req: QueryRequestInfo {
                source,
                normalized: false,
                protocol_version: self.proto,
                output_format,
                expect_one,
                implicit_limit: implicit_limit as u64,
                inline_typeids: compilation_flags & COMPILATION_INJECT_OUTPUT_TYPE_IDS != 0,
                inline_typenames: compilation_flags & COMPILATION_INJECT_OUTPUT_TYPE_NAMES != 0,
                inline_objectids: compilation_flags & COMPILATION_INJECT_OUTPUT_OBJECT_IDS != 0,
                allow_capabilities,
            },
            state_tid,
            state_data,
        })
    }

    /// Install the client-supplied session state. A shape mismatch gets a
    /// fresh state description before the error goes out, so the client
    /// can re-encode and retry.
    fn apply_client_state(&mut self, type_id: Uuid, data: &[u8]) -> Result<(), Error> {
        match self.view.inner.decode_state(type_id, data) {
            Ok(()) => Ok(()),
            Err(err) if err.kind == ErrorKind::StateMismatch => {
                self.emit_state_description();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn emit_state_description(&mut self) {
        server::state_description(
            &mut self.out,
            self.view.inner.state_type_id(),
            &self.view.inner.state_type_desc(),
        );
        self.view.mark_state_desc_sent();
    }

    fn emit_command_data_description(&mut self, compiled: &CompiledQuery) {
        let group = &compiled.group;
        server::command_data_description(
            &mut self.out,
            group.capabilities(),
            group.cardinality.as_byte(),
            group.in_type_id(),
            group.in_type_data(),
            group.out_type_id(),
            group.out_type_data(),
        );
    }

    pub(crate) async fn compile_query(
        &mut self,
        req: &QueryRequestInfo,
    ) -> Result<CompiledQuery, Error> {
        #[cfg(test)]
        {
            self.compile_count += 1;
        }
        let tenant = self.tenant.clone();
        let compiled = tenant.compiler().compile(&self.dbname, req).await?;
        if compiled.group.is_empty() {
            return Err(Error::internal("compiler returned an empty unit group"));
        }
        Ok(compiled)
    }

    pub(crate) async fn handle_parse(&mut self, mut msg: Incoming) -> Result<(), Error> {
        let preq = self.read_request(&mut msg)?;
        msg.finish()?;
        self.apply_client_state(preq.state_tid, &preq.state_data)?;

        let compiled = self.compile_query(&preq.req).await?;
        self.emit_command_data_description(&compiled);
        self.last_anon_compiled = Some((preq.req.stable_hash(), compiled));
        Ok(())
    }

    pub(crate) async fn handle_execute(&mut self, mut msg: Incoming) -> Result<(), Error> {
        let preq = self.read_request(&mut msg)?;
        let expected_in_tid = msg.get_uuid()?;
        let expected_out_tid = msg.get_uuid()?;
        let bind_args = msg.get_len_bytes()?;
        msg.finish()?;
        self.apply_client_state(preq.state_tid, &preq.state_data)?;

        let hash = preq.req.stable_hash();
        // The anonymous slot is cleared no matter what: a follow-up
        // Execute pays the normal cache path, which respects each unit's
        // cacheable flag.
        let slot = self.last_anon_compiled.take();
        let compiled = match slot {
            Some((cached_hash, cached))
                if cached_hash == hash
                    && cached.group.in_type_id() == expected_in_tid
                    && cached.group.out_type_id() == expected_out_tid =>
            {
                debug!("reusing the last anonymous compilation");
                cached
            }
            _ => match self.view.inner.lookup_compiled(&preq.req) {
                Some(hit) => hit,
                None => {
                    let fresh = self.compile_query(&preq.req).await?;
                    if fresh.group.cacheable() {
                        self.view.inner.cache_compiled(preq.req.clone(), &fresh);
                    }
                    fresh
                }
            },
        };

        if let Some(name) = capability::first_disabled(
            compiled.group.capabilities(),
            preq.req.allow_capabilities,
        ) {
            return Err(Error::disabled_capability(format!(
                "cannot execute the query: the {name} capability is disabled"
            )));
        }

        if compiled.group.in_type_id() != expected_in_tid {
            // The client bound arguments against a stale shape; give it
            // the current one to re-encode against.
            self.emit_command_data_description(&compiled);
            return Err(Error::new(
                ErrorKind::ParameterTypeMismatch,
                "specified parameter type(s) do not match the parameter types \
                 inferred from the query",
            ));
        }
        if compiled.group.out_type_id() != expected_out_tid {
            self.emit_command_data_description(&compiled);
        }

        let status = self.execute_compiled(&preq, &compiled, &bind_args).await?;

        if self.view.state_desc_changed() {
            self.emit_state_description();
        }
        server::command_complete(
            &mut self.out,
            compiled.group.capabilities(),
            &status,
            self.view.inner.state_type_id(),
            &self.view.inner.serialize_state(),
        );
        Ok(())
    }

    async fn execute_compiled(
        &mut self,
        preq: &ParseExecuteRequest,
        compiled: &CompiledQuery,
        bind_args: &[u8],
    ) -> Result<String, Error> {
        self.check_cancelled()?;
        let first = compiled.group.first();
        let rollback_path = self.view.inner.in_tx_error()
            || first.tx_savepoint_rollback
            || first.tx_abort_migration;

        let tenant = self.tenant.clone();
        let mut be = tenant.acquire_backend(&self.dbname).await?;
        let result = if rollback_path {
            self.execute_rollback(&mut be, compiled).await
        } else if compiled.group.needs_script() {
            self.execute_script(&mut be, compiled, bind_args).await
        } else {
            self.execute_unit(&mut be, preq, compiled, bind_args).await
        };
        tenant.release_backend(be);
        result
    }

    /// Rollback fast path: the view is in a failed transaction, or the
    /// unit explicitly unwinds one.
    async fn execute_rollback(
        &mut self,
        be: &mut T::Backend,
        compiled: &CompiledQuery,
    ) -> Result<String, Error> {
        if compiled.group.len() > 1 {
            return Err(Error::internal(
                "transaction rollback compiled to more than one unit",
            ));
        }
        let unit = compiled.group.first();
        if !unit.is_rollback_like() {
            return Err(Error::new(
                ErrorKind::Execution,
                "current transaction is aborted, commands ignored until end of \
                 transaction block",
            ));
        }
        for sql in &unit.sql {
            be.sql_execute(sql).await?;
        }
        if unit.tx_savepoint_rollback {
            let name = unit
                .savepoint_name
                .as_deref()
                .ok_or_else(|| Error::internal("savepoint rollback unit without a name"))?;
            self.view.inner.rollback_tx_to_savepoint(name)?;
            self.view.inner.clear_tx_error();
        } else {
            self.view.inner.abort_tx();
        }
        Ok(unit.status.clone())
    }

    /// Single-statement path.
    async fn execute_unit(
        &mut self,
        be: &mut T::Backend,
        preq: &ParseExecuteRequest,
        compiled: &CompiledQuery,
        bind_args: &[u8],
    ) -> Result<String, Error> {
        let unit = compiled.group.first();

        let mut state: Option<Bytes> = None;
        if !self.view.inner.in_tx() {
            let serialized = self.view.inner.serialize_state();
            // Elide the state roundtrip when the backend already holds it.
            if be.last_state().as_deref() != Some(serialized.as_ref()) {
                state = Some(serialized);
            }
        }

        self.view.inner.start(unit)?;

        let tenant = self.tenant.clone();
        if let Some(template) = &unit.create_db_template {
            tenant.on_before_create_db_from_template(template).await?;
        }
        if let Some(db) = &unit.drop_db {
            tenant.on_before_drop_db(db, &self.dbname).await?;
        }

        match self
            .execute_unit_inner(be, preq, compiled, bind_args, state.as_deref())
            .await
        {
            Ok((new_types, config_ops)) => {
                self.view.inner.on_success(unit, new_types.as_ref());
                if !config_ops.is_empty() {
                    self.view.inner.apply_config_ops(&config_ops)?;
                }
                if let Some(effect) = unit_side_effect(unit) {
                    self.view.inner.signal_side_effects(effect);
                }
                if !self.view.inner.in_tx() {
                    be.set_last_state(self.view.inner.serialize_state());
                }
                Ok(unit.status.clone())
            }
            Err(err) => {
                self.view.inner.on_error();
                if unit.tx_commit && !be.in_tx() && self.view.inner.in_tx() {
                    // A failed COMMIT left the backend out of the
                    // transaction while the view still thinks it is in
                    // one; reconcile by aborting the view's.
                    self.view.inner.abort_tx();
                }
                Err(err)
            }
        }
    }

    async fn execute_unit_inner(
        &mut self,
        be: &mut T::Backend,
        preq: &ParseExecuteRequest,
        compiled: &CompiledQuery,
        bind_args: &[u8],
        state: Option<&[u8]>,
    ) -> Result<(Option<NewTypes>, Vec<ConfigOp>), Error> {
        let unit = compiled.group.first();

        if unit.system_config {
            self.execute_system_config(be, unit, state).await?;
            return Ok((None, Vec::new()));
        }
        if unit.ddl_stmt_id.is_some() {
            let new_types = be.run_ddl(unit, state).await?;
            return Ok((new_types, Vec::new()));
        }

        let args = recode_bind_args(compiled, bind_args)?;
        let params = ExecuteParams {
            unit,
            bind_args: &args,
            state,
            use_prep_stmt: unit.sql_hash.is_some(),
            fence: BatchFence::Sync,
        };

        if unit.needs_readback {
            let rows = be.parse_execute(params, None).await?;
            let ops = rows
                .iter()
                .map(|row| ConfigOp::from_readback_row(row))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((None, ops))
        } else if unit.is_explain {
            let rows = be.parse_execute(params, None).await?;
            let joined: Vec<u8> = rows.concat();
            let tenant = self.tenant.clone();
            let analyzed = tenant
                .compiler()
                .analyze_explain_output(&preq.req, &joined)
                .await?;
            server::data_row(&mut self.out, &analyzed);
            Ok((None, Vec::new()))
        } else {
            be.parse_execute(params, Some(&mut self.out)).await?;
            Ok((None, Vec::new()))
        }
    }

    /// System-config units run through a dedicated sequence: pre-hook, a
    /// no-op query carrying the state, the (single) config statement with
    /// readback, cache invalidation, and a backend reload when the setting
    /// lives in the backend's own configuration.
    pub(crate) async fn execute_system_config(
        &mut self,
        be: &mut T::Backend,
        unit: &QueryUnit,
        state: Option<&[u8]>,
    ) -> Result<(), Error> {
        let tenant = self.tenant.clone();
        tenant.on_system_config_change().await?;

        be.sql_fetch_col("select 1", state).await?;

        let ops = if unit.sql.is_empty() {
            unit.config_ops.clone()
        } else {
            if unit.sql.len() != 1 {
                return Err(Error::internal(
                    "system config must compile to a single statement",
                ));
            }
            let rows = be.sql_fetch_col(&unit.sql[0], None).await?;
            match rows.first() {
                Some(first) if first.first() == Some(&0x01) => rows
                    .iter()
                    .map(|row| ConfigOp::from_readback_row(row))
                    .collect::<Result<Vec<_>, _>>()?,
                _ => unit.config_ops.clone(),
            }
        };
        self.view.inner.apply_config_ops(&ops)?;

        be.sql_execute("delete from _config_cache").await?;
        if unit.backend_config {
            be.sql_execute("SELECT pg_reload_conf()").await?;
        }
        Ok(())
    }

    /// Script path: more than one unit, or a unit the server must read
    /// data back from.
    async fn execute_script(
        &mut self,
        be: &mut T::Backend,
        compiled: &CompiledQuery,
        bind_args: &[u8],
    ) -> Result<String, Error> {
        let implicit_tx = !self.view.inner.in_tx();

        let mut state: Option<Bytes> = None;
        if implicit_tx {
            let serialized = self.view.inner.serialize_state();
            if be.last_state().as_deref() != Some(serialized.as_ref()) {
                state = Some(serialized);
            }
        }

        let args = recode_bind_args(compiled, bind_args)?;
        let mut side_effects: Vec<SideEffect> = Vec::new();
        let mut sent_without_sync = false;

        let outcome = self
            .script_units(
                be,
                compiled,
                &args,
                &mut state,
                implicit_tx,
                &mut side_effects,
                &mut sent_without_sync,
            )
            .await;

        let outcome = match outcome {
            Ok(status) => Ok(status),
            Err(err) => {
                if implicit_tx {
                    self.view.inner.abort_tx();
                    // Keep the pipeline in a known state: the backend may
                    // hold half of a script.
                    be.force_error().await;
                }
                Err(err)
            }
        };

        if sent_without_sync {
            let sync_result = be.sync().await;
            if outcome.is_ok() {
                sync_result?;
            }
        }

        let status = outcome?;
        if implicit_tx {
            self.view.inner.commit_implicit_tx(&side_effects);
            for effect in side_effects {
                self.view.inner.signal_side_effects(effect);
            }
        }
        if !self.view.inner.in_tx() {
            be.set_last_state(self.view.inner.serialize_state());
        }
        Ok(status)
    }

    #[allow(clippy::too_many_arguments)]
    async fn script_units(
        &mut self,
        be: &mut T::Backend,
        compiled: &CompiledQuery,
        args: &[u8],
        state: &mut Option<Bytes>,
        implicit_tx: bool,
        side_effects: &mut Vec<SideEffect>,
        sent_without_sync: &mut bool,
    ) -> Result<String, Error> {
        let group = compiled.group.clone();
        let total = group.len();
        let mut status = String::new();
        let mut idx = 0;

        while idx < total {
            // A batch is either a run of plain units, or a single unit
            // that requires a pipeline boundary (DDL or readback).
            let boundary = |u: &QueryUnit| u.ddl_stmt_id.is_some() || u.needs_readback;
            let mut end = idx;
            while end < total && !boundary(&group.units[end]) {
                end += 1;
            }
            let batch_end = if end == idx { idx + 1 } else { end };
            let batch_has_boundary = boundary(&group.units[batch_end - 1]) && end == idx;
            let is_last_batch = batch_end == total;
            let fence = if is_last_batch && !batch_has_boundary {
                BatchFence::Sync
            } else {
                BatchFence::Flush
            };

            for i in idx..batch_end {
                let unit = &group.units[i];
                self.check_cancelled()?;
                self.view.inner.start_implicit(unit);

                if let Some(effect) = unit_side_effect(unit) {
                    if implicit_tx || self.view.inner.in_tx() {
                        side_effects.push(effect);
                    } else {
                        return Err(Error::internal("Side-effects in implicit transaction!"));
                    }
                }

                let unit_fence = if i + 1 == batch_end {
                    fence
                } else {
                    BatchFence::Flush
                };

                let mut new_types: Option<NewTypes> = None;
                if unit.system_config {
                    self.execute_system_config(be, unit, state.as_deref()).await?;
                } else if unit.ddl_stmt_id.is_some() {
                    new_types = be.run_ddl(unit, state.as_deref()).await?;
                } else if unit.needs_readback {
                    let params = ExecuteParams {
                        unit,
                        bind_args: args,
                        state: state.as_deref(),
                        use_prep_stmt: false,
                        fence: unit_fence,
                    };
                    let rows = be.parse_execute(params, None).await?;
                    let ops = rows
                        .iter()
                        .map(|row| ConfigOp::from_readback_row(row))
                        .collect::<Result<Vec<_>, _>>()?;
                    self.view.inner.apply_config_ops(&ops)?;
                } else {
                    let params = ExecuteParams {
                        unit,
                        bind_args: args,
                        state: state.as_deref(),
                        use_prep_stmt: false,
                        fence: unit_fence,
                    };
                    be.parse_execute(params, Some(&mut self.out)).await?;
                }

                // State travels with the first send only; once the backend
                // confirmed it, errors must not restore the old image.
                *state = None;

                self.view.inner.on_success(unit, new_types.as_ref());
                if !unit.status.is_empty() {
                    status = unit.status.clone();
                }
            }

            *sent_without_sync = fence == BatchFence::Flush;
            idx = batch_end;
        }

        Ok(status)
    }

    /// Compile and run one utility EdgeQL statement (used by restore for
    /// transaction control).
    pub(crate) async fn execute_utility_stmt(
        &mut self,
        be: &mut T::Backend,
        eql: &str,
    ) -> Result<(), Error> {
        let req = QueryRequestInfo {
            source: eql.to_string(),
            normalized: false,
            protocol_version: self.proto,
            output_format: OutputFormat::None,
            expect_one: false,
            implicit_limit: 0,
            inline_typeids: false,
            inline_typenames: false,
            inline_objectids: false,
            allow_capabilities: capability::ALL,
        };

        let compiled = match self.view.inner.lookup_compiled(&req) {
            Some(hit) => hit,
            None => {
                let fresh = self.compile_query(&req).await?;
                if fresh.group.cacheable() {
                    self.view.inner.cache_compiled(req.clone(), &fresh);
                }
                fresh
            }
        };
        if compiled.group.len() != 1 {
            return Err(Error::internal(
                "utility statement compiled to more than one unit",
            ));
        }
        let group = compiled.group.clone();
        let unit = group.first();

        self.view.inner.start(unit)?;
        let mut result: Result<(), Error> = Ok(());
        for sql in &unit.sql {
            if let Err(err) = be.sql_execute(sql).await {
                result = Err(err);
                break;
            }
        }
        match result {
            Ok(()) => {
                self.view.inner.on_success(unit, None);
                Ok(())
            }
            Err(err) => {
                self.view.inner.on_error();
                if unit.tx_commit && !be.in_tx() && self.view.inner.in_tx() {
                    self.view.inner.abort_tx();
                }
                Err(err)
            }
        }
    }
}

