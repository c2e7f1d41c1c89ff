use dotenv::dotenv;
use log::info;
use std::env;
use tenderdesk::prelude::*;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv().ok();
    pretty_env_logger::init();

    let api_url = env::var("TENDERDESK_API_URL")?;
    let email = env::var("TENDERDESK_EMAIL")?;
    let password = env::var("TENDERDESK_PASSWORD")?;
    let kind = match env::var("TENDERDESK_DOMAIN").as_deref() {
        Ok("writer") => DomainKind::Writer,
        _ => DomainKind::Client,
    };

    let desk = TenderDesk::new_with_options(&api_url, ClientOptions::from_env())?;
    let session = desk.context(kind);

    // セッションイベントを表示
    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("Session event: {:?}", event);
        }
    });

    println!("Starting {} session demo", kind);

    let (client, writer) = desk.mount_all().await;
    println!("Restored sessions: client={:?}, writer={:?}", client, writer);

    if !session.state().is_authenticated() {
        // ログイン
        println!("\nSigning in as {}", email);
        match session.login(&email, &password).await? {
            SessionState::PasswordChangeRequired(identity) => {
                println!("{} must change the temporary password first", identity.email);
                if let Ok(new_password) = env::var("TENDERDESK_NEW_PASSWORD") {
                    session.change_password(&password, &new_password).await?;
                    println!("Password changed");
                }
            }
            state => println!("Signed in: {:?}", state),
        }
    }

    if let Some(fires_at) = session.scheduler().fires_at() {
        info!("Next refresh at unix time {}", fires_at);
    }

    // プロフィールを取得
    let profile = desk.fetch(kind).get(&session.domain().endpoints.profile);
    match profile.execute::<serde_json::Value>().await {
        Ok(body) => println!("\nProfile: {}", body),
        Err(e) => println!("\nProfile request failed: {}", e.user_message()),
    }

    println!("\nSigning out");
    session.logout();
    desk.unmount_all();
    println!("State after logout: {:?}", session.state());

    Ok(())
}
