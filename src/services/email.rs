use lettre::{
    Message, SmtpTransport, Transport,
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
};
use log::{error, info, warn};

pub struct EmailService;

impl EmailService {
    /// Best-effort booking confirmation after a successful settlement. A send
    /// failure is logged and never fails the settlement itself.
    pub async fn send_booking_confirmation(
        email: &str,
        listing_title: &str,
        booking_id: &str,
        total: f64,
        currency: &str,
    ) -> bool {
        match Self::try_send_confirmation(email, listing_title, booking_id, total, currency).await
        {
            Ok(_) => {
                info!("Booking confirmation sent to {}", email);
                true
            }
            Err(e) => {
                error!("Failed to send booking confirmation to {}: {}", email, e);
                false
            }
        }
    }

    async fn try_send_confirmation(
        email: &str,
        listing_title: &str,
        booking_id: &str,
        total: f64,
        currency: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mail_user = crate::config::Config::mail_user();
        let mail_password = crate::config::Config::mail_password();

        if mail_user.is_empty() || mail_password.is_empty() {
            warn!("Email credentials not configured. Skipping email send.");
            return Err("Email not configured".into());
        }

        let from_mailbox: Mailbox = crate::config::Config::mail_from().parse()?;
        let to_mailbox: Mailbox = email.parse()?;

        let email_body = format!(
            r#"
            <!DOCTYPE html>
            <html>
            <body style="font-family: Arial, sans-serif; color: #333;">
                <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
                    <h2>🐎 Your booking is confirmed</h2>
                    <p>Payment received for <strong>{}</strong>.</p>
                    <p>Booking reference: <strong>{}</strong></p>
                    <p>Amount charged: <strong>{:.2} {}</strong></p>
                    <p style="color: #666; font-size: 12px;">
                        This is an automated message, please do not reply.
                    </p>
                </div>
            </body>
            </html>
            "#,
            listing_title,
            booking_id,
            total,
            currency.to_uppercase()
        );

        let message = Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject("Booking confirmed")
            .header(ContentType::TEXT_HTML)
            .body(email_body)?;

        let credentials = Credentials::new(mail_user, mail_password);
        let mailer = SmtpTransport::relay(&crate::config::Config::mail_host())?
            .port(crate::config::Config::mail_port())
            .credentials(credentials)
            .build();

        mailer.send(&message)?;
        Ok(())
    }
}
