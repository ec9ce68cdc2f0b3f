use std::collections::HashMap;

use actix_web::{get, post, web, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::id::MessageId;
use crate::message::{truncate_preview, StoredMessage};
use crate::service::Service;

#[derive(Deserialize)]
pub struct CreateRoomRequest {
    member_a: i64,
    member_b: i64,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    sender_id: i64,
    content: String,
    reply_to_id: Option<MessageId>,
}

#[derive(Deserialize)]
pub struct MarkReadRequest {
    user_id: i64,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    page: Option<usize>,
    size: Option<usize>,
}

/// A persisted message plus its resolved reply-to reference, ready for
/// real-time delivery to connected clients.
#[derive(Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    message: StoredMessage,
    reply_to: Option<ReplyPreview>,
}

#[derive(Serialize)]
pub struct ReplyPreview {
    message_id: MessageId,
    sender_id: i64,
    preview: String,
}

#[derive(Serialize)]
pub struct QueueDepthsResponse {
    depths: Vec<usize>,
}

/// Resolves reply-to references in one batched lookup instead of one query
/// per message.
async fn with_reply_previews(service: &Service, messages: Vec<StoredMessage>) -> Vec<MessageView> {
    let preview_chars = service.config().preview_max_chars;
    let reply_ids: Vec<MessageId> = messages.iter().filter_map(|m| m.reply_to_id).collect();

    let referenced: HashMap<MessageId, StoredMessage> = service
        .find_messages(&reply_ids)
        .await
        .into_iter()
        .map(|m| (m.message_id, m))
        .collect();

    messages
        .into_iter()
        .map(|message| {
            let reply_to = message
                .reply_to_id
                .and_then(|id| referenced.get(&id))
                .map(|m| ReplyPreview {
                    message_id: m.message_id,
                    sender_id: m.sender_id,
                    preview: truncate_preview(&m.content, preview_chars),
                });
            MessageView { message, reply_to }
        })
        .collect()
}

#[post("/rooms")]
async fn create_room(
    service: web::Data<Service>,
    request: web::Json<CreateRoomRequest>,
) -> Result<impl Responder, Error> {
    let room = service
        .register_room(request.member_a, request.member_b)
        .await?;
    Ok(web::Json(room))
}

#[get("/{chatroom_id}/metadata")]
async fn room_metadata(
    service: web::Data<Service>,
    path: web::Path<i64>,
) -> Result<impl Responder, Error> {
    let meta = service.room_metadata(*path).await?;
    Ok(web::Json(meta))
}

#[post("/{chatroom_id}/messages")]
async fn send_message(
    service: web::Data<Service>,
    path: web::Path<i64>,
    request: web::Json<SendMessageRequest>,
) -> Result<impl Responder, Error> {
    let request = request.into_inner();
    let stored = service
        .send_message(*path, request.sender_id, request.content, request.reply_to_id)
        .await?;

    let mut views = with_reply_previews(&service, vec![stored]).await;
    Ok(web::Json(views.remove(0)))
}

#[get("/{chatroom_id}/messages")]
async fn history(
    service: web::Data<Service>,
    path: web::Path<i64>,
    query: web::Query<HistoryQuery>,
) -> Result<impl Responder, Error> {
    let messages = service
        .fetch_history(*path, query.page.unwrap_or(0), query.size)
        .await;
    Ok(web::Json(with_reply_previews(&service, messages).await))
}

#[post("/{chatroom_id}/read")]
async fn mark_read(
    service: web::Data<Service>,
    path: web::Path<i64>,
    request: web::Json<MarkReadRequest>,
) -> Result<impl Responder, Error> {
    service.mark_read(*path, request.user_id).await?;
    Ok("OK")
}

#[get("/queues")]
async fn queue_depths(service: web::Data<Service>) -> Result<impl Responder, Error> {
    Ok(web::Json(QueueDepthsResponse {
        depths: service.queue_depths().await,
    }))
}

#[post("/flush")]
async fn flush(service: web::Data<Service>) -> Result<impl Responder, Error> {
    service.flush_now().await;
    Ok("OK")
}

pub fn service() -> Scope {
    web::scope("/chat")
        .service(create_room)
        .service(queue_depths)
        .service(flush)
        .service(room_metadata)
        .service(send_message)
        .service(history)
        .service(mark_read)
}
