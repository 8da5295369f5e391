//! One verification run.

use pact_common::{RetryPolicy, TransportError};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};
use url::Url;

use super::config::{PublishOptions, VerifierSettings};
use super::provider_client::{self, StateAction};
use super::report::{InteractionOutcome, InteractionResult, SourceError, VerificationReport};
use super::sources::{self, LoadedPact, PublishTarget};
use crate::matching::match_response;
use crate::model::{HttpInteraction, PactInteraction};

/// Load every source, verify every interaction and publish results.
#[instrument(skip_all, fields(provider = %settings.provider.name))]
pub(crate) async fn run(settings: VerifierSettings, name: String, version: String) -> VerificationReport {
    let mut report = VerificationReport {
        fail_if_no_pacts_found: settings.fail_if_no_pacts_found,
        ..VerificationReport::default()
    };
    let client = match provider_client::client(&settings.options) {
        Ok(client) => client,
        Err(e) => {
            report.source_errors.push(SourceError {
                source: "http client".to_string(),
                message: e.to_string(),
            });
            return report;
        }
    };
    let retry = RetryPolicy::with_defaults();

    let (pacts, errors) = sources::load_all(&client, &retry, &settings).await;
    report.source_errors = errors;
    report.interactions_loaded = pacts.iter().map(|p| p.pact.interactions.len()).sum();
    info!(
        pacts = pacts.len(),
        interactions = report.interactions_loaded,
        "Verifying provider"
    );

    for loaded in &pacts {
        let start = report.results.len();
        for interaction in &loaded.pact.interactions {
            report.results.push(verify_interaction(&client, &settings, loaded, interaction).await);
        }

        if let (Some(publish), Some(target)) = (&settings.publish, &loaded.publish) {
            let results = &report.results[start..];
            if let Err(e) = publish_results(&client, &retry, target, publish, loaded, results, &name, &version).await {
                warn!(pact = %loaded.pact.label(), error = %e, "Failed to publish verification results");
            }
        }
    }

    info!(
        success = report.success(),
        failures = report.failures().count(),
        "Verification finished"
    );
    report
}

async fn verify_interaction(
    client: &Client,
    settings: &VerifierSettings,
    loaded: &LoadedPact,
    interaction: &PactInteraction,
) -> InteractionResult {
    let result = |pending: bool, outcome: InteractionOutcome| InteractionResult {
        consumer: loaded.pact.consumer.clone(),
        description: interaction.description().to_string(),
        pending,
        outcome,
    };

    let Some(http) = interaction.as_http() else {
        return result(
            loaded.pending,
            InteractionOutcome::Skipped {
                reason: format!("{} interactions are not verified over HTTP", interaction.type_name()),
            },
        );
    };
    let pending = loaded.pending || http.pending;

    if !settings.filters.matches(&http.description, &http.provider_states) {
        return result(
            pending,
            InteractionOutcome::Skipped {
                reason: "excluded by filters".to_string(),
            },
        );
    }

    let outcome = verify_http(client, settings, http).await;
    match &outcome {
        InteractionOutcome::Passed => info!(description = %http.description, "Interaction verified"),
        InteractionOutcome::Failed { mismatches } => {
            warn!(description = %http.description, mismatches = mismatches.len(), pending, "Interaction failed");
        }
        InteractionOutcome::Error { message } => {
            warn!(description = %http.description, error = %message, pending, "Interaction errored");
        }
        InteractionOutcome::Skipped { .. } => {}
    }
    result(pending, outcome)
}

async fn verify_http(client: &Client, settings: &VerifierSettings, http: &HttpInteraction) -> InteractionOutcome {
    let base = match settings
        .provider
        .transport_for(http.transport.as_deref())
        .map(|t| t.base_url(&settings.provider.host))
    {
        Some(Ok(base)) => base,
        Some(Err(e)) => return InteractionOutcome::Error { message: e.to_string() },
        None => {
            return InteractionOutcome::Error {
                message: "No provider transport is configured".to_string(),
            };
        }
    };

    let mut set_up = 0;
    let mut setup_error = None;
    if let Some(state_change) = &settings.state_change {
        for state in &http.provider_states {
            if let Err(e) = provider_client::change_state(client, state_change, state, StateAction::Setup).await {
                setup_error = Some(InteractionOutcome::Error {
                    message: format!("Provider state '{}' could not be set up: {e}", state.name),
                });
                break;
            }
            set_up += 1;
        }
    }

    let outcome = match setup_error {
        Some(error) => error,
        None => match provider_client::send(client, &base, &http.request, &settings.custom_headers).await {
            Ok(actual) => {
                let mismatches = match_response(&http.response, &actual);
                if mismatches.is_empty() {
                    InteractionOutcome::Passed
                } else {
                    InteractionOutcome::Failed { mismatches }
                }
            }
            Err(e) => InteractionOutcome::Error {
                message: format!("Request to the provider failed: {e}"),
            },
        },
    };

    // Only states whose setup succeeded are torn down.
    if let Some(state_change) = settings.state_change.as_ref().filter(|c| c.teardown) {
        for state in http.provider_states[..set_up].iter().rev() {
            if let Err(e) = provider_client::change_state(client, state_change, state, StateAction::Teardown).await {
                warn!(state = %state.name, error = %e, "Provider state teardown failed");
            }
        }
    }
    outcome
}

fn test_result(result: &InteractionResult) -> Value {
    let mut entry = json!({
        "interactionDescription": result.description,
        "success": matches!(result.outcome, InteractionOutcome::Passed),
    });
    match &result.outcome {
        InteractionOutcome::Failed { mismatches } => {
            entry["mismatches"] = json!(mismatches);
        }
        InteractionOutcome::Error { message } => {
            entry["exceptions"] = json!([{ "message": message }]);
        }
        InteractionOutcome::Passed | InteractionOutcome::Skipped { .. } => {}
    }
    entry
}

fn pacticipant_url(base: &Url, segments: &[&str]) -> Result<Url, TransportError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| TransportError::invalid_input(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(pact = %loaded.pact.label(), url = %target.results_url))]
async fn publish_results(
    client: &Client,
    retry: &RetryPolicy,
    target: &PublishTarget,
    publish: &PublishOptions,
    loaded: &LoadedPact,
    results: &[InteractionResult],
    name: &str,
    version: &str,
) -> Result<(), TransportError> {
    let version_segment = publish.provider_version.as_str();
    let provider = loaded.pact.provider.as_str();

    for tag in &publish.tags {
        let url = pacticipant_url(&target.broker_base, &["pacticipants", provider, "versions", version_segment, "tags", tag])?;
        put(client, retry, target, &url).await?;
    }
    if let Some(branch) = &publish.branch {
        let url = pacticipant_url(
            &target.broker_base,
            &["pacticipants", provider, "branches", branch, "versions", version_segment],
        )?;
        put(client, retry, target, &url).await?;
    }

    let verified = results.iter().filter(|r| !matches!(r.outcome, InteractionOutcome::Skipped { .. }));
    let success = verified.clone().all(|r| matches!(r.outcome, InteractionOutcome::Passed));
    let mut body = json!({
        "success": success,
        "providerApplicationVersion": publish.provider_version,
        "verifiedBy": { "implementation": name, "version": version },
        "testResults": verified.map(test_result).collect::<Vec<_>>(),
    });
    if let Some(build_url) = &publish.build_url {
        body["buildUrl"] = json!(build_url);
    }

    let body = &body;
    retry
        .execute(move || async move {
            let response = target
                .credentials
                .apply(client.post(target.results_url.clone()))
                .json(body)
                .send()
                .await?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(TransportError::status(status.as_u16(), target.results_url.as_str()))
            }
        })
        .await?;
    info!(success, "Published verification results");
    Ok(())
}

async fn put(client: &Client, retry: &RetryPolicy, target: &PublishTarget, url: &Url) -> Result<(), TransportError> {
    retry
        .execute(move || async move {
            let response = target
                .credentials
                .apply(client.put(url.clone()))
                .json(&json!({}))
                .send()
                .await?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(TransportError::status(status.as_u16(), url.as_str()))
            }
        })
        .await
}
