use std::sync::Arc;
use std::time::Duration;

use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_core::services::background::background_service;

use metagate::cache::ownership::OwnershipCoordinator;
use metagate::cache::ResponseCache;
use metagate::client::control_plane::HttpControlPlane;
use metagate::client::HttpClient;
use metagate::config::{Config, Tls};
use metagate::handlers::AppState;
use metagate::logging::Logger;
use metagate::service::http::GatewayHttpApp;
use metagate::store::etcd::EtcdStore;
use metagate::store::memory::MemoryStore;
use metagate::store::MetaStore;
use metagate::tokens::{TokenManager, TokenRefresher};

fn main() {
    // Read command-line arguments
    let opt = Opt::parse_args();

    // Load configuration with optional override
    let config = Config::load_yaml_with_opt_override(&opt).expect("Failed to load configuration");

    // Initialize logging, through the async file writer when configured
    let logger = config.log.clone().map(Logger::new);
    match &logger {
        Some(logger) => logger.init_env_logger(),
        None => env_logger::init(),
    }

    let http = HttpClient::with_cache(Arc::new(ResponseCache::new(&config.client_cache)))
        .expect("Failed to initialize HTTP client");

    log::info!("Loading tokens...");
    let tokens = Arc::new(
        TokenManager::new(config.tokens.clone(), http.clone())
            .expect("Failed to initialize token manager"),
    );

    let store: Arc<dyn MetaStore> = match &config.store {
        Some(etcd) => {
            log::info!("Using etcd metadata store at {:?}", etcd.host);
            Arc::new(EtcdStore::new(etcd.clone()))
        }
        None => {
            log::info!("Using static fleet of {} clusters", config.clusters.len());
            Arc::new(MemoryStore::from_seeds(&config.clusters))
        }
    };

    let ownership = match (&config.store, &config.self_endpoint) {
        (Some(_), Some(endpoint)) => Some(Arc::new(OwnershipCoordinator::new(
            store.clone(),
            endpoint.clone(),
        ))),
        _ => None,
    };

    let state = Arc::new(AppState {
        store,
        tokens: tokens.clone(),
        cache: Arc::new(ResponseCache::new(&config.cache)),
        ownership,
        http: http.clone(),
        control_plane: Arc::new(HttpControlPlane::new(http)),
        request_timeout: Duration::from_secs(config.request_timeout),
        phase_timeout: Duration::from_secs(config.phase_timeout),
        proxy_timeout: Duration::from_secs(config.proxy_timeout),
    });

    // Create Pingora server with optional configuration
    let mut gateway_server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    let mut http_service = GatewayHttpApp::http_service(state);

    // Add listeners from configuration
    log::info!("Adding listeners...");
    for list_cfg in config.listeners {
        match list_cfg.tls {
            Some(Tls {
                cert_path,
                key_path,
            }) => {
                let mut settings = TlsSettings::intermediate(&cert_path, &key_path)
                    .expect("Adding TLS listener shouldn't fail");
                if list_cfg.offer_h2 {
                    settings.enable_h2();
                }
                http_service.add_tls_with_settings(&list_cfg.address.to_string(), None, settings);
            }
            None => {
                http_service.add_tcp(&list_cfg.address.to_string());
            }
        }
    }

    log::info!("Bootstrapping...");
    gateway_server.bootstrap();

    log::info!("Bootstrapped. Adding Services...");
    gateway_server.add_service(http_service);
    gateway_server.add_service(background_service("token refresher", TokenRefresher::new(tokens)));
    if let Some(logger) = logger {
        gateway_server.add_service(logger);
    }

    log::info!("Starting Server...");
    gateway_server.run_forever();
}
