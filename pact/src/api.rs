//! Boundary entry points.
//!
//! Plain-value functions over one process-wide [`PactContext`], for use by
//! language bindings. Every call catches panics and turns errors into the
//! documented result codes; the message of the last error on the calling
//! thread is available from [`last_error`]. Handle-returning functions
//! return `0` on failure.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;

use once_cell::sync::Lazy;
use tracing::{error, warn};

use crate::config::Config;
use crate::context::PactContext;
use crate::error::{ErrorCategory, PactError, Result};
use crate::matching::MatchConfig;
use crate::model::InteractionPart;
use crate::pact_file::FsStorage;
use crate::registry::{InteractionHandle, MessageHandle, PactHandle, VerifierHandle};
use crate::verifier::BrokerQuery;

static CONTEXT: Lazy<Option<PactContext>> = Lazy::new(|| {
    let config = Config::from_env().unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring invalid environment configuration");
        Config::default()
    });
    PactContext::new(config)
        .inspect_err(|e| error!(error = %e, "Engine context could not be created"))
        .ok()
});

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn context() -> Result<&'static PactContext> {
    CONTEXT
        .as_ref()
        .ok_or_else(|| PactError::internal("engine context is unavailable"))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn record(error: &PactError) {
    LAST_ERROR.with(|last| *last.borrow_mut() = Some(error.to_string()));
}

/// Run `f`, mapping errors with `on_error` and panics to `on_panic`.
fn guarded<T, R>(on_panic: R, on_error: impl FnOnce(&PactError) -> R, ok: impl FnOnce(T) -> R, f: impl FnOnce() -> Result<T>) -> R {
    LAST_ERROR.with(|last| last.borrow_mut().take());
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => ok(value),
        Ok(Err(e)) => {
            record(&e);
            on_error(&e)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "Engine call panicked");
            LAST_ERROR.with(|last| *last.borrow_mut() = Some(format!("panic: {message}")));
            on_panic
        }
    }
}

fn flag(f: impl FnOnce() -> Result<()>) -> bool {
    guarded(false, |_| false, |()| true, f)
}

fn optional<T>(f: impl FnOnce() -> Result<T>) -> Option<T> {
    guarded(None, |_| None, Some, f)
}

fn part(code: i32) -> Result<InteractionPart> {
    InteractionPart::from_code(code)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Message of the last failed call on this thread.
#[must_use]
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|last| last.borrow().clone())
}

/// Install the tracing subscriber with a filter directive. Returns `false`
/// when one was already installed.
pub fn init_with_log_level(level: &str) -> bool {
    let tracing = pact_common::TracingConfig::default().with_filter(level);
    pact_common::init_tracing(&tracing)
}

/// Install the tracing subscriber from the environment configuration.
pub fn init() -> bool {
    context().is_ok_and(|context| pact_common::init_tracing(&context.config().tracing()))
}

/// Stop every mock server and plugin.
pub fn shutdown() {
    if let Ok(context) = context() {
        context.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Contract model
// ---------------------------------------------------------------------------

/// Create a pact; `0` on failure.
#[must_use]
pub fn new_pact(consumer: &str, provider: &str) -> u32 {
    optional(|| Ok(context()?.registry.new_pact(consumer, provider).id())).unwrap_or(0)
}

/// Release a pact and the plugins only it used.
pub fn free_pact_handle(pact: u32) -> bool {
    optional(|| {
        let context = context()?;
        let handle = PactHandle::new(pact);
        context.plugins.cleanup_plugins(handle);
        Ok(context.registry.free_pact_handle(handle))
    })
    .unwrap_or(false)
}

/// Add an HTTP interaction; `0` on failure.
#[must_use]
pub fn new_interaction(pact: u32, description: &str) -> u32 {
    optional(|| {
        context()?
            .registry
            .new_interaction(PactHandle::new(pact), description)
            .map(InteractionHandle::id)
    })
    .unwrap_or(0)
}

/// Rename an interaction.
pub fn upon_receiving(interaction: u32, description: &str) -> bool {
    flag(|| context()?.registry.upon_receiving(InteractionHandle::new(interaction), description))
}

/// Add a provider state.
pub fn given(interaction: u32, state: &str) -> bool {
    flag(|| context()?.registry.given(InteractionHandle::new(interaction), state))
}

/// Add a parameter to a provider state.
pub fn given_with_param(interaction: u32, state: &str, name: &str, value: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .given_with_param(InteractionHandle::new(interaction), state, name, value)
    })
}

/// Add a provider state with a JSON object of parameters.
pub fn given_with_params(interaction: u32, state: &str, params: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .given_with_params(InteractionHandle::new(interaction), state, params)
    })
}

/// Set the request method and path.
pub fn with_request(interaction: u32, method: &str, path: &str) -> bool {
    flag(|| context()?.registry.with_request(InteractionHandle::new(interaction), method, path))
}

/// Set one query parameter value.
pub fn with_query_parameter(interaction: u32, name: &str, index: usize, value: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .with_query_parameter(InteractionHandle::new(interaction), name, index, value)
    })
}

/// Set one header value of the request (`0`) or response (`1`).
pub fn with_header(interaction: u32, part_code: i32, name: &str, index: usize, value: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .with_header(InteractionHandle::new(interaction), part(part_code)?, name, index, value)
    })
}

/// Set a text body.
pub fn with_body(interaction: u32, part_code: i32, content_type: Option<&str>, body: &str) -> bool {
    flag(|| {
        context()?.registry.with_body(
            InteractionHandle::new(interaction),
            part(part_code)?,
            non_empty(content_type),
            body,
        )
    })
}

/// Set a binary body.
pub fn with_binary_file(interaction: u32, part_code: i32, content_type: Option<&str>, bytes: &[u8]) -> bool {
    flag(|| {
        context()?.registry.with_binary_file(
            InteractionHandle::new(interaction),
            part(part_code)?,
            non_empty(content_type),
            bytes,
        )
    })
}

/// Set a multipart body from a file. Returns the error message on failure.
pub fn with_multipart_file(
    interaction: u32,
    part_code: i32,
    content_type: &str,
    file: &Path,
    part_name: &str,
) -> std::result::Result<(), String> {
    guarded(
        Err("panic while building the multipart body".to_string()),
        |e| Err(e.to_string()),
        Ok,
        || {
            context()?.registry.with_multipart_file(
                InteractionHandle::new(interaction),
                part(part_code)?,
                content_type,
                file,
                part_name,
            )
        },
    )
}

/// Set the response status.
pub fn response_status(interaction: u32, status: u16) -> bool {
    flag(|| context()?.registry.response_status(InteractionHandle::new(interaction), status))
}

/// Set the response status from a number or a status matcher.
pub fn response_status_v2(interaction: u32, status: &str) -> bool {
    flag(|| context()?.registry.response_status_v2(InteractionHandle::new(interaction), status))
}

/// Set the specification version by code.
pub fn with_specification(pact: u32, version: i32) -> bool {
    flag(|| context()?.registry.with_specification(PactHandle::new(pact), version))
}

/// Add a pact metadata value.
pub fn with_pact_metadata(pact: u32, namespace: &str, name: &str, value: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .with_pact_metadata(PactHandle::new(pact), namespace, name, value)
    })
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Add an asynchronous message; `0` on failure.
#[must_use]
pub fn new_async_message(pact: u32, description: &str) -> u32 {
    optional(|| {
        context()?
            .registry
            .new_async_message(PactHandle::new(pact), description)
            .map(MessageHandle::id)
    })
    .unwrap_or(0)
}

/// Add a synchronous message; `0` on failure.
#[must_use]
pub fn new_sync_message_interaction(pact: u32, description: &str) -> u32 {
    optional(|| {
        context()?
            .registry
            .new_sync_message_interaction(PactHandle::new(pact), description)
            .map(MessageHandle::id)
    })
    .unwrap_or(0)
}

/// Add a provider state to a message.
pub fn message_given(message: u32, state: &str) -> bool {
    flag(|| context()?.registry.message_given(MessageHandle::new(message), state))
}

/// Add a provider state parameter to a message.
pub fn message_given_with_param(message: u32, state: &str, name: &str, value: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .message_given_with_param(MessageHandle::new(message), state, name, value)
    })
}

/// Add a provider state with a JSON object of parameters to a message.
pub fn message_given_with_params(message: u32, state: &str, params: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .message_given_with_params(MessageHandle::new(message), state, params)
    })
}

/// Rename a message.
pub fn message_expects_to_receive(message: u32, description: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .message_expects_to_receive(MessageHandle::new(message), description)
    })
}

/// Set text message contents.
pub fn message_with_contents(message: u32, content_type: Option<&str>, body: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .message_with_contents(MessageHandle::new(message), non_empty(content_type), body)
    })
}

/// Set binary message contents from the first `len` bytes.
pub fn message_with_binary_contents(message: u32, content_type: Option<&str>, bytes: &[u8], len: usize) -> bool {
    flag(|| {
        context()?.registry.message_with_binary_contents(
            MessageHandle::new(message),
            non_empty(content_type),
            bytes,
            len,
        )
    })
}

/// Add a message metadata value.
pub fn message_with_metadata(message: u32, key: &str, value: &str) -> bool {
    flag(|| context()?.registry.message_with_metadata(MessageHandle::new(message), key, value))
}

/// Set the response contents at `index` of a synchronous message.
pub fn sync_message_set_response_contents(message: u32, index: usize, content_type: Option<&str>, body: &str) -> bool {
    flag(|| {
        context()?.registry.sync_message_set_response_contents(
            MessageHandle::new(message),
            index,
            non_empty(content_type),
            body,
        )
    })
}

/// Set binary request contents of a synchronous message.
pub fn sync_message_set_request_contents_bin(
    message: u32,
    content_type: Option<&str>,
    bytes: &[u8],
    len: usize,
) -> bool {
    flag(|| {
        context()?.registry.sync_message_set_request_contents_bin(
            MessageHandle::new(message),
            non_empty(content_type),
            bytes,
            len,
        )
    })
}

/// Set binary contents of one response of a synchronous message.
pub fn sync_message_set_response_contents_bin(
    message: u32,
    index: usize,
    content_type: Option<&str>,
    bytes: &[u8],
    len: usize,
) -> bool {
    flag(|| {
        context()?.registry.sync_message_set_response_contents_bin(
            MessageHandle::new(message),
            index,
            non_empty(content_type),
            bytes,
            len,
        )
    })
}

/// Literal example of a message as JSON.
#[must_use]
pub fn message_reify(message: u32) -> Option<String> {
    optional(|| context()?.registry.message_reify(MessageHandle::new(message)))
}

// ---------------------------------------------------------------------------
// Mock server
// ---------------------------------------------------------------------------

const fn mock_server_error_code(error: &PactError) -> i32 {
    match error {
        PactError::TlsConfiguration(_) => -6,
        _ => match error.category() {
            ErrorCategory::InvalidHandle => -1,
            ErrorCategory::BindFailure => -3,
            ErrorCategory::AddressInvalid => -5,
            _ => -4,
        },
    }
}

/// Start a mock server for a pact on `host:port`.
///
/// Returns the port, or `-1` invalid handle, `-3` bind failure, `-4` panic
/// or internal error, `-5` invalid address, `-6` TLS failure.
#[must_use]
pub fn create_mock_server_for_pact(pact: u32, address: &str, tls: bool) -> i32 {
    guarded(-4, mock_server_error_code, i32::from, || {
        context()?.create_mock_server(PactHandle::new(pact), address, tls, MatchConfig::default())
    })
}

/// Every interaction was requested and no request failed.
#[must_use]
pub fn mock_server_matched(port: u16) -> bool {
    optional(|| Ok(context()?.mock_servers.matched(port))).unwrap_or(false)
}

/// Mismatches as a JSON array; `None` for an unknown port.
#[must_use]
pub fn mock_server_mismatches(port: u16) -> Option<String> {
    optional(|| {
        context()?
            .mock_servers
            .mismatches_json(port)
            .map(|json| json.to_string())
            .ok_or(PactError::MockServerNotFound(port))
    })
}

/// PEM certificate of a TLS mock server.
#[must_use]
pub fn mock_server_tls_certificate(port: u16) -> Option<String> {
    optional(|| {
        context()?
            .mock_servers
            .tls_certificate(port)
            .ok_or(PactError::MockServerNotFound(port))
    })
}

/// Stop a mock server.
pub fn cleanup_mock_server(port: u16) -> bool {
    optional(|| Ok(context()?.mock_servers.cleanup(port))).unwrap_or(false)
}

fn write_error_code(error: &PactError) -> i32 {
    match error {
        PactError::MockServerNotFound(_) | PactError::InvalidHandle { .. } => 3,
        _ => 2,
    }
}

/// Write the pact of a mock server into `dir`.
///
/// Returns `0` ok, `1` panic, `2` write failure, `3` no mock server on
/// the port.
pub fn write_pact_file_by_port(port: u16, dir: &str, overwrite: bool) -> i32 {
    guarded(1, write_error_code, |_| 0, || {
        context()?.write_mock_server_pact(port, Path::new(dir), overwrite)
    })
}

/// Write a pact by handle into `dir`; the pact is frozen afterwards.
///
/// Returns `0` ok, `1` panic, `2` write failure, `3` invalid handle.
pub fn pact_handle_write_file(pact: u32, dir: &str, overwrite: bool) -> i32 {
    guarded(1, write_error_code, |_| 0, || {
        context()?.write_pact(PactHandle::new(pact), &FsStorage::new(dir), overwrite)
    })
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

/// Declare that a pact uses a plugin.
///
/// Returns `0` ok, `1` panic, `2` load failure, `3` invalid pact handle.
pub fn using_plugin(pact: u32, name: &str, version: Option<&str>) -> u32 {
    guarded(
        1,
        |e| if e.category() == ErrorCategory::InvalidHandle { 3 } else { 2 },
        |()| 0,
        || context()?.using_plugin(PactHandle::new(pact), name, non_empty(version)),
    )
}

fn plugin_error_code(error: &PactError) -> u32 {
    match error {
        PactError::Frozen(_) => 2,
        PactError::InvalidHandle { .. } => 3,
        PactError::InvalidArgument(_) => 4,
        PactError::Json(_) => 5,
        PactError::PluginLoad { .. } | PactError::PluginReported(_) | PactError::PluginProtocol(_) => 6,
        _ => 1,
    }
}

/// Build one part of an interaction through its plugin.
///
/// Returns `0` ok, `1` panic, `2` mock server started, `3` invalid
/// handle, `4` invalid content type, `5` invalid JSON, `6` plugin error.
pub fn plugin_interaction_contents(interaction: u32, part_code: i32, content_type: &str, definition: &str) -> u32 {
    guarded(1, plugin_error_code, |()| 0, || {
        let context = context()?;
        context.plugins.interaction_contents(
            &context.registry,
            &context.mock_servers,
            InteractionHandle::new(interaction),
            part(part_code)?,
            content_type,
            definition,
        )
    })
}

/// Build message contents through its plugin. Codes as
/// [`plugin_interaction_contents`].
pub fn plugin_message_contents(message: u32, content_type: &str, definition: &str) -> u32 {
    guarded(1, plugin_error_code, |()| 0, || {
        let context = context()?;
        context.plugins.message_contents(
            &context.registry,
            &context.mock_servers,
            MessageHandle::new(message),
            content_type,
            definition,
        )
    })
}

/// Release the plugins a pact holds.
pub fn cleanup_plugins(pact: u32) {
    let _ = optional(|| {
        context()?.plugins.cleanup_plugins(PactHandle::new(pact));
        Ok(())
    });
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

fn verifier(handle: u32) -> VerifierHandle {
    VerifierHandle::new(handle)
}

/// Create a verifier; `0` on failure.
#[must_use]
pub fn verifier_new_for_application(name: &str, version: &str) -> u32 {
    optional(|| {
        let context = context()?;
        Ok(context
            .registry
            .verifier_new_for_application(context.config(), name, version)
            .id())
    })
    .unwrap_or(0)
}

/// Set the provider name and default transport; a port of `0` uses the
/// scheme default.
pub fn verifier_set_provider_info(handle: u32, name: &str, scheme: &str, host: &str, port: u16, path: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .verifier_set_provider_info(verifier(handle), name, scheme, host, Some(port), path)
    })
}

/// Add a provider transport.
pub fn verifier_add_provider_transport(handle: u32, protocol: &str, port: u16, path: &str, scheme: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .verifier_add_provider_transport(verifier(handle), protocol, Some(port), path, scheme)
    })
}

/// Set interaction filters.
pub fn verifier_set_filter_info(handle: u32, description: &str, state: &str, no_state: bool) -> bool {
    flag(|| {
        context()?
            .registry
            .verifier_set_filter_info(verifier(handle), description, state, no_state)
    })
}

/// Set the provider state change endpoint.
pub fn verifier_set_provider_state(handle: u32, url: &str, teardown: bool, body: bool) -> bool {
    flag(|| {
        context()?
            .registry
            .verifier_set_provider_state(verifier(handle), url, teardown, body)
    })
}

/// Set TLS verification and the request timeout in milliseconds.
pub fn verifier_set_verification_options(handle: u32, disable_ssl_verification: bool, timeout_ms: u64) -> bool {
    flag(|| {
        context()?
            .registry
            .verifier_set_verification_options(verifier(handle), disable_ssl_verification, timeout_ms)
    })
}

/// Publish results after the run.
pub fn verifier_set_publish_options(
    handle: u32,
    provider_version: &str,
    build_url: Option<&str>,
    tags: &[&str],
    branch: Option<&str>,
) -> bool {
    flag(|| {
        context()?
            .registry
            .verifier_set_publish_options(verifier(handle), provider_version, build_url, tags, branch)
    })
}

/// Only verify pacts of these consumers.
pub fn verifier_set_consumer_filters(handle: u32, consumers: &[&str]) -> bool {
    flag(|| {
        context()?
            .registry
            .verifier_set_consumer_filters(verifier(handle), consumers)
    })
}

/// Whether a run that loads nothing fails.
pub fn verifier_set_fail_if_no_pacts_found(handle: u32, fail: bool) -> bool {
    flag(|| {
        context()?
            .registry
            .verifier_set_fail_if_no_pacts_found(verifier(handle), fail)
    })
}

/// Add a header to every provider request.
pub fn verifier_add_custom_header(handle: u32, name: &str, value: &str) -> bool {
    flag(|| {
        context()?
            .registry
            .verifier_add_custom_header(verifier(handle), name, value)
    })
}

/// Verify a pact file.
pub fn verifier_add_file_source(handle: u32, path: &str) -> bool {
    flag(|| context()?.registry.verifier_add_file_source(verifier(handle), path))
}

/// Verify every pact for the provider in a directory.
pub fn verifier_add_directory_source(handle: u32, path: &str) -> bool {
    flag(|| context()?.registry.verifier_add_directory_source(verifier(handle), path))
}

/// Verify a pact fetched from a URL.
pub fn verifier_url_source(
    handle: u32,
    url: &str,
    username: Option<&str>,
    password: Option<&str>,
    token: Option<&str>,
) -> bool {
    flag(|| {
        context()?
            .registry
            .verifier_url_source(verifier(handle), url, username, password, token)
    })
}

/// Verify the pacts a broker selects for the provider.
pub fn verifier_broker_source_with_selectors(handle: u32, query: BrokerQuery<'_>) -> bool {
    flag(|| {
        context()?
            .registry
            .verifier_broker_source_with_selectors(verifier(handle), query)
    })
}

const VERIFY_OK: i32 = 0;
const VERIFY_FAILED: i32 = 1;
const VERIFY_PANIC: i32 = 3;
const VERIFY_INVALID: i32 = 4;

/// Run a verification and wait for it.
///
/// Returns `0` success, `1` verification failed, `3` panic, `4` invalid
/// arguments (unknown handle, run already in flight).
pub fn verifier_execute(handle: u32) -> i32 {
    guarded(
        VERIFY_PANIC,
        |_| VERIFY_INVALID,
        |success: bool| if success { VERIFY_OK } else { VERIFY_FAILED },
        || {
            let context = context()?;
            let task = context.verifier_execute(verifier(handle))?;
            Ok(context.block_on(task)??.success())
        },
    )
}

/// Start a verification and return immediately; `callback` receives the
/// result code once, on a runtime worker.
///
/// Returns `false` when the run could not be started; the callback is not
/// invoked then.
pub fn verifier_execute_with_callback(handle: u32, callback: impl FnOnce(i32) + Send + 'static) -> bool {
    flag(|| {
        let context = context()?;
        let task = context.verifier_execute(verifier(handle))?;
        context.runtime_handle()?.spawn(async move {
            let code = match task.await {
                Ok(report) if report.success() => VERIFY_OK,
                Ok(_) => VERIFY_FAILED,
                Err(e) => {
                    error!(error = %e, "Verification run failed");
                    VERIFY_PANIC
                }
            };
            callback(code);
        });
        Ok(())
    })
}

/// Report of the last completed run as JSON.
#[must_use]
pub fn verifier_json(handle: u32) -> Option<String> {
    optional(|| {
        let report = context()?
            .registry
            .verifier_last_report(verifier(handle))?
            .ok_or_else(|| PactError::invalid_argument("The verifier has not completed a run"))?;
        Ok(serde_json::to_string(&report)?)
    })
}

/// Release a verifier.
pub fn verifier_shutdown(handle: u32) -> bool {
    optional(|| Ok(context()?.registry.verifier_shutdown(verifier(handle)))).unwrap_or(false)
}
