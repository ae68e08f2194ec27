use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::routes::{
    get_runtimes_handler, json_error_handler, post_execute_handler, query_error_handler,
};

pub fn build_server(server_config: ServerConfig, engine: web::Data<Engine>) -> std::io::Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(engine.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .app_data(web::QueryConfig::default().error_handler(query_error_handler))
            .wrap(middleware::Logger::default())
            .service(post_execute_handler)
            .service(get_runtimes_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
