use ulid::Ulid;

/// Codec between reservation ids and the payload carried by the QR code.
/// Image rasterization and camera scanning live outside this process; by
/// the time a scan reaches the server it is the payload string again.
pub trait TokenCodec: Send + Sync {
    fn encode(&self, reservation_id: Ulid) -> String;
    fn decode(&self, token: &str) -> Option<Ulid>;
}

/// Default codec: the canonical ULID string is the payload, which is what
/// the kiosk QR codes carry.
pub struct UlidTokenCodec;

impl TokenCodec for UlidTokenCodec {
    fn encode(&self, reservation_id: Ulid) -> String {
        reservation_id.to_string()
    }

    fn decode(&self, token: &str) -> Option<Ulid> {
        Ulid::from_string(token.trim()).ok()
    }
}
