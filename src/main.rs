/*
 * Responsibility
 * - tokio runtime 起動
 * - app::run() の呼び出し（ロジックは置かない）
 */
use keychain_auth::{app, error::AppError};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    app::run().await
}
