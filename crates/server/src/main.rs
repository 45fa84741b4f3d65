/// Supervisor Fleet - Server
///
/// 节点发现服务：扫描网段内的守护进程 Agent，提供 REST API 与前端实时推送

mod api;
mod app_state;
mod config;
mod db;
mod discovery;
mod repositories;
mod services;
mod ws;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use crate::{
    app_state::AppState,
    db::establish_connection,
    discovery::WsAgentConnector,
    repositories::Repositories,
    services::DiscoveryService,
    ws::FrontendConnectionManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    // 加载配置
    let cfg = config::Config::from_env()?;

    // 初始化日志，RUST_LOG 优先于 LOG_LEVEL
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!("🚀 启动 Supervisor Fleet Server...");
    info!(
        "✅ 配置加载成功: 默认超时 {}s, 默认并发 {}, 最宽网段 /{}",
        cfg.discovery.default_timeout_secs,
        cfg.discovery.default_workers,
        cfg.discovery.min_prefix_len
    );

    // 建立数据库连接 (SeaORM)
    let sea_db = establish_connection(&cfg.database_url).await?;
    info!("✅ SeaORM 数据库连接成功");

    // 前端连接管理器同时作为发现事件的出口
    let frontend_manager = FrontendConnectionManager::new();
    let discovery = DiscoveryService::new(
        Repositories::sea_orm(sea_db),
        Arc::new(frontend_manager.clone()),
        Arc::new(WsAgentConnector),
        cfg.discovery.clone(),
    );
    info!("✅ 节点发现服务初始化成功");

    // 创建应用状态
    let app_state = AppState::new(discovery.clone(), frontend_manager);

    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // 构建应用路由
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/ws/frontend", get(ws::handle_frontend_websocket))
        .nest("/api", api::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    // 启动服务器
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server_port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 退出前把运行中的扫描标记为已取消
    discovery.shutdown().await;
    info!("👋 服务器已停止");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("监听退出信号失败: {}", e);
        std::future::pending::<()>().await;
    }
    info!("收到退出信号，正在关闭...");
}

async fn root_handler() -> &'static str {
    "Supervisor Fleet Server API v1"
}

async fn health_handler() -> &'static str {
    "OK"
}
