//! End-to-end scenario E: trimming a CONTEXT-heavy session that also
//! carries a multi-image message. Exercises `ContextWindow::enforce`'s
//! image-clamp step ahead of categorical trimming.

use penguin_core::config::{CategoryRatios, TokenCounterStrategy};
use penguin_core::message::{Content, ContentPart, ImageRef, Message, MessageCategory, Role};
use penguin_core::{ContextWindow, TokenCounterChain};

fn context_message(text: &str) -> Message {
    Message::new(Role::User, MessageCategory::Context, Content::text(text))
}

fn image_part(tag: &str) -> ContentPart {
    ContentPart::Image {
        image: ImageRef::Url {
            url: format!("https://example.com/{tag}.png"),
        },
    }
}

#[test]
fn clamps_images_before_falling_back_to_categorical_trim() {
    let window = ContextWindow::new(
        1000,
        CategoryRatios {
            system: 0.0,
            context: 0.35,
            dialog: 0.0,
            system_output: 0.0,
            error: 0.0,
        },
        TokenCounterChain::from_preference(&[TokenCounterStrategy::CharRate]),
    );

    // Five CONTEXT messages around 300 tokens (~1200 chars) each; the most
    // recent carries two images, tripping the image-clamp step ahead of
    // categorical trimming (W=1000, CONTEXT max=350). Oldest-first trim
    // removes the other four before this one, so it survives into the
    // final outcome regardless of the trim pass.
    let filler = "x".repeat(1200);
    let mut messages: Vec<Message> = (0..5).map(|_| context_message(&filler)).collect();
    let image_message_id = messages[4].id.clone();
    messages[4].content = Content::Parts(vec![ContentPart::text(&filler), image_part("first"), image_part("second")]);

    let outcome = window.enforce(&messages).unwrap();
    assert!(outcome.changed);

    let total: usize = outcome.messages.iter().map(|m| m.tokens_or_zero()).sum();
    assert!(total <= window.total_tokens);
    assert!(outcome.messages.len() < messages.len(), "categorical trim must have dropped the older CONTEXT messages");

    let surviving = outcome
        .messages
        .iter()
        .find(|m| m.id == image_message_id)
        .expect("the newest message must survive oldest-first trimming");
    assert_eq!(surviving.content.image_count(), 1, "image clamp must leave only the most recent image");
    let flat = surviving.content.to_flat_text();
    assert!(flat.contains("[image elided"), "the elided image must leave a textual trace");

    let Content::Parts(parts) = &surviving.content else {
        panic!("surviving message must still be multi-part");
    };
    let elided = parts
        .iter()
        .find(|p| matches!(p, ContentPart::ElidedImage { .. }))
        .expect("the dropped image must be represented structurally, not just in prose");
    assert_eq!(
        elided,
        &ContentPart::ElidedImage {
            original_reference: "https://example.com/first.png".to_string()
        }
    );
}
