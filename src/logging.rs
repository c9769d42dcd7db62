use tracing::Level;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{
    filter::Targets,
    fmt::{
        self,
        format::{Format, Full},
        time::SystemTime,
    },
    prelude::*,
};

const LOG_FILE_NAME: &str = "savings-backend.log";

fn build_base_log_format() -> Format<Full, SystemTime> {
    return fmt::format()
        .with_level(true)
        .with_ansi(false)
        .with_file(true)
        .with_target(true)
        .with_thread_names(true);
}

fn build_filter() -> Targets {
    Targets::new()
        .with_target("sqlx", Level::INFO)
        .with_target("hyper_util", Level::INFO)
        .with_target("reqwest", Level::INFO)
        .with_target("tungstenite", Level::INFO)
        .with_target("tokio_tungstenite", Level::INFO)
        .with_default(Level::DEBUG)
}

fn daily_appender(dir: &str) -> RollingFileAppender {
    rolling::daily(dir, LOG_FILE_NAME)
}

pub fn setup_logging(base_log_dir: Option<&str>) {
    let stdout_layer =
        tracing_subscriber::fmt::layer().event_format(build_base_log_format().with_ansi(true));

    let subscriber = tracing_subscriber::registry()
        .with(build_filter())
        .with(stdout_layer);

    match base_log_dir {
        Some(dir) => {
            let log_file_layer = tracing_subscriber::fmt::layer()
                .event_format(build_base_log_format())
                .with_writer(daily_appender(dir));
            let json_file_layer = tracing_subscriber::fmt::layer()
                .event_format(build_base_log_format().json())
                .with_writer(daily_appender(&format!("{}/structured", dir)));
            subscriber.with(log_file_layer).with(json_file_layer).init();
        }
        None => subscriber.init(),
    }
}
