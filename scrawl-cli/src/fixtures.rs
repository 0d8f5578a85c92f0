//! Demo fixtures: a retro board worth of sticky notes

use anyhow::Result;
use chrono::Utc;
use scrawl_connectors::{
    BlobStore, ImageId, MemoryBlobStore, MemoryProjectStore, NoteImage, Project, ProjectId,
    UserId,
};

pub const DEMO_PROJECT: &str = "demo-retro";
pub const DEMO_USER: &str = "demo-user";

const STICKY_NOTES: [&str; 3] = [
    "onboarding flow teh first screen confuses people\nonboarding needs fewer steps\nsignup drop off is high",
    "billing page crashes on submit\nbilling errors adn retries frustrate users\ninvoice emails arrive late",
    "support queue keeps growing\nsupport answers are slow\nhire more support staff",
];

/// Seed a project with three sticky-note images
pub async fn seed_demo_project(
    store: &MemoryProjectStore,
    blobs: &MemoryBlobStore,
) -> Result<(ProjectId, UserId)> {
    let project_id = ProjectId::new(DEMO_PROJECT);
    let user_id = UserId::new(DEMO_USER);
    store
        .insert_project(Project::new(
            project_id.clone(),
            user_id.clone(),
            "Quarterly retro board",
        ))
        .await;

    for (index, body) in STICKY_NOTES.iter().enumerate() {
        let blob_key = format!("demo/sticky-{index}.png");
        BlobStore::put(blobs, &blob_key, body.as_bytes().to_vec())
            .await
            .map_err(|e| anyhow::anyhow!("seed blob: {e}"))?;
        store
            .insert_image(NoteImage {
                id: ImageId::new(),
                project_id: project_id.clone(),
                blob_key,
                content_type: "image/png".to_string(),
                uploaded_at: Utc::now(),
            })
            .await;
    }
    Ok((project_id, user_id))
}
