use std::process::ExitCode;
use std::sync::Arc;

use handlename_core::bridge::{ResolveFailure, ResolveRequest, ResolveResponse};
use handlename_core::config::Config;
use handlename_core::fetch::HttpFetcher;
use handlename_core::store::JsonFileStore;
use handlename_core::{Error, Identity, Resolver};
use tokio::task::JoinSet;

use crate::cli::ResolveArgs;

/// One command-line identity and its parse result.
struct Target {
    input: String,
    identity: Result<Identity, handlename_core::error::ResolveError>,
}

fn targets(args: &ResolveArgs) -> Vec<Target> {
    let handles = args.identities.iter().map(|input| Target {
        input: input.clone(),
        identity: Identity::parse(input),
    });
    let channels = args.channel.iter().map(|id| Target {
        input: id.clone(),
        identity: Identity::from_parts(None, Some(id)),
    });
    handles.chain(channels).collect()
}

pub async fn run(config: &Config, args: ResolveArgs) -> anyhow::Result<ExitCode> {
    let fetcher = HttpFetcher::new(
        config.resolver.request_timeout(),
        &config.resolver.user_agent,
    )
    .map_err(Error::from)?;
    let store = Arc::new(JsonFileStore::new(config.cache_path()));
    let resolver = Arc::new(Resolver::load(Arc::new(fetcher), store, &config.resolver).await);

    let targets = targets(&args);
    let mut responses: Vec<Option<ResolveResponse>> = vec![None; targets.len()];
    let mut tasks = JoinSet::new();

    for (index, target) in targets.iter().enumerate() {
        match &target.identity {
            Ok(identity) => {
                let resolver = resolver.clone();
                let identity = identity.clone();
                tasks.spawn(async move {
                    let request = ResolveRequest::for_identity(&identity);
                    let response = match resolver.resolve(&identity).await {
                        Ok(resolution) => ResolveResponse::success(&request, resolution),
                        Err(err) => ResolveResponse::failure(&request, ResolveFailure::from(&err)),
                    };
                    (index, response)
                });
            }
            Err(err) => {
                let request = ResolveRequest {
                    handle: Some(target.input.clone()),
                    channel_id: None,
                };
                responses[index] = Some(ResolveResponse::failure(&request, ResolveFailure::from(err)));
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        let (index, response) = joined?;
        responses[index] = Some(response);
    }
    resolver.flush().await;

    let responses: Vec<ResolveResponse> = responses.into_iter().flatten().collect();
    let failed = responses.iter().filter(|r| r.error.is_some()).count();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&responses)?);
    } else {
        for (target, response) in targets.iter().zip(&responses) {
            match (&response.display_name, &response.error) {
                (Some(name), _) if response.cached == Some(true) => println!("{name} (cached)"),
                (Some(name), _) => println!("{name}"),
                (None, Some(failure)) => eprintln!("{}: {}", target.input, failure.message),
                (None, None) => eprintln!("{}: no result", target.input),
            }
        }
    }

    if failed > 0 {
        tracing::warn!(failed, total = responses.len(), "some identities did not resolve");
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_keep_argument_order() {
        let args = ResolveArgs {
            identities: vec!["@First".into(), "/channel/UCsecond".into(), "@".into()],
            channel: vec!["UCthird".into()],
            json: false,
        };
        let targets = targets(&args);
        let parsed: Vec<_> = targets.iter().map(|t| t.identity.clone().ok()).collect();
        assert_eq!(
            parsed,
            vec![
                Some(Identity::Handle("First".into())),
                Some(Identity::ChannelId("UCsecond".into())),
                None,
                Some(Identity::ChannelId("UCthird".into())),
            ]
        );
    }
}
