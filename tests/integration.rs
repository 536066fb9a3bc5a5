use quillan_backend::config::Settings;
use quillan_backend::{build_state, routes::build_router};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use std::time::Duration;

async fn spawn_server() -> String {
    spawn_server_with(Settings::default()).await
}

async fn spawn_server_with(settings: Settings) -> String {
    let state = build_state(settings).expect("state");
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client_as(user: &str) -> reqwest::Client {
    let mut h = HeaderMap::new();
    h.insert("x-user-id", HeaderValue::from_str(user).unwrap());
    reqwest::Client::builder().default_headers(h).build().unwrap()
}

fn question(prompt: &str) -> serde_json::Value {
    json!({
        "pregunta": prompt,
        "opciones": {"a": "Right", "b": "Wrong", "c": "Wrong too", "d": "Nope"},
        "respuesta_correcta": "a",
        "justificacion": "Because a."
    })
}

fn sample_course_payload() -> serde_json::Value {
    json!({
        "title": "Cell biology",
        "content": {
            "type": "course",
            "data": {
                "titulo": "Cells",
                "modulos": [
                    {"titulo": "Intro", "resumen": "What a cell is.", "cuestionario": [question("q1"), question("q2")]},
                    {"titulo": "Organelles", "cuestionario": [question("q3")]}
                ]
            }
        },
        "attachments": [
            {"type": "video", "title": "Tour", "youtube_url": "https://youtu.be/dQw4w9WgXcQ"}
        ]
    })
}

fn sample_quiz_payload() -> serde_json::Value {
    json!({
        "title": "Warm-up",
        "content": {"type": "quiz", "data": [question("q1"), question("q2"), question("q3")]}
    })
}

async fn create(base: &str, client: &reqwest::Client, payload: serde_json::Value) -> String {
    let resp = client
        .post(format!("{}/api/v1/content", base))
        .json(&payload)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    resp.json::<serde_json::Value>().await.unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string()
}

/// Recording happens off the request path, so poll for it.
async fn wait_for_submissions(base: &str, client: &reqwest::Client, content_id: &str, expected: usize) -> serde_json::Value {
    for _ in 0..40 {
        let body = client
            .get(format!("{}/api/v1/content/{}/submissions", base, content_id))
            .send()
            .await
            .unwrap()
            .json::<serde_json::Value>()
            .await
            .unwrap();
        if body["total"].as_u64() == Some(expected as u64) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("submissions for {content_id} never reached {expected}");
}

async fn post_json(client: &reqwest::Client, url: String, body: serde_json::Value) -> (u16, serde_json::Value) {
    let resp = client.post(url).json(&body).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(serde_json::Value::Null))
}

#[tokio::test]
async fn content_crud_and_learner_view() {
    let base = spawn_server().await;
    let owner = client_as("teacher-1");
    let learner = reqwest::Client::new();
    let id = create(&base, &owner, sample_course_payload()).await;

    let list = owner
        .get(format!("{}/api/v1/content", base))
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(list["total"], 1);
    assert_eq!(list["items"][0]["kind"], "course");
    assert_eq!(list["items"][0]["total_questions"], 3);

    let view = learner
        .get(format!("{}/api/v1/content/{}", base, id))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(!view.contains("respuesta_correcta"));
    assert!(view.contains("https://www.youtube.com/embed/dQw4w9WgXcQ"));

    let share = owner
        .get(format!("{}/api/v1/content/{}/share", base, id))
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(share["link"], format!("http://localhost:5173/#view/{}", id));
    assert!(share["qr_svg"].as_str().unwrap().starts_with("data:image/svg+xml;base64,"));

    let forbidden = client_as("someone-else")
        .delete(format!("{}/api/v1/content/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), 403);

    let deleted = owner
        .delete(format!("{}/api/v1/content/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);
    let gone = learner
        .get(format!("{}/api/v1/content/{}", base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn empty_quiz_is_rejected() {
    let base = spawn_server().await;
    let (status, body) = post_json(
        &client_as("teacher-1"),
        format!("{}/api/v1/content", base),
        json!({"content": {"type": "quiz", "data": []}}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn course_session_retry_then_complete_records_once() {
    let base = spawn_server().await;
    let owner = client_as("teacher-1");
    let learner = reqwest::Client::new();
    let content_id = create(&base, &owner, sample_course_payload()).await;

    let (status, session) = post_json(
        &learner,
        format!("{}/api/v1/content/{}/course-sessions", base, content_id),
        json!({"student_name": "Ada"}),
    )
    .await;
    assert_eq!(status, 201);
    assert_eq!(session["state"], "awaiting_first_attempt");
    assert_eq!(session["attempt_key"], "0-1");
    let sid = session["session_id"].as_str().unwrap().to_string();
    let url = |action: &str| format!("{}/api/v1/course-sessions/{}/{}", base, sid, action);

    let (status, _) = post_json(&learner, url("submit"), json!({"answers": {"0": "a"}})).await;
    assert_eq!(status, 400);

    let (status, body) = post_json(&learner, url("submit"), json!({"answers": {"0": "b", "1": "a"}})).await;
    assert_eq!(status, 200);
    assert_eq!(body["outcome"]["raw_score"], 1);
    assert_eq!(body["outcome"]["passing_score"], 2);
    assert_eq!(body["session"]["state"], "module_failed");

    let (status, body) = post_json(&learner, url("advance"), json!({})).await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "INVALID_TRANSITION");

    let (_, body) = post_json(&learner, url("retry"), json!({})).await;
    assert_eq!(body["attempt_key"], "0-2");
    assert_eq!(body["module"]["questions"][0]["options"][0]["state"], "unselected");

    let (_, body) = post_json(&learner, url("submit"), json!({"answers": {"0": "a", "1": "a"}})).await;
    assert_eq!(body["session"]["state"], "module_passed");

    let (_, body) = post_json(&learner, url("advance"), json!({})).await;
    assert_eq!(body["module_index"], 1);
    assert_eq!(body["progress_percent"], 50.0);

    post_json(&learner, url("submit"), json!({"answers": {"0": "a"}})).await;
    let (_, body) = post_json(&learner, url("advance"), json!({})).await;
    assert_eq!(body["state"], "course_completed");
    assert_eq!(body["result"]["score"], 3);
    assert_eq!(body["result"]["total_questions"], 3);
    assert_eq!(body["result"]["module_attempts"], json!({"0": 2, "1": 1}));

    let (status, _) = post_json(&learner, url("advance"), json!({})).await;
    assert_eq!(status, 409);

    let submissions = wait_for_submissions(&base, &owner, &content_id, 1).await;
    let item = &submissions["items"][0];
    assert_eq!(item["student_name"], "Ada");
    assert_eq!(item["score"], 3);
    assert_eq!(item["modules"][0]["label"], "M1: Intro - passed in 2 attempt(s)");
    assert_eq!(item["modules"][1]["label"], "M2: Organelles - passed in 1 attempt(s)");

    for _ in 0..3 {
        let view = learner
            .get(format!("{}/api/v1/course-sessions/{}", base, sid))
            .send()
            .await
            .unwrap()
            .json::<serde_json::Value>()
            .await
            .unwrap();
        assert_eq!(view["state"], "course_completed");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let submissions = wait_for_submissions(&base, &owner, &content_id, 1).await;
    assert_eq!(submissions["total"], 1);

    let (_, body) = post_json(&learner, url("restart"), json!({})).await;
    assert_eq!(body["state"], "awaiting_first_attempt");
    assert_eq!(body["module_attempts"], json!({"0": 1}));
}

#[tokio::test]
async fn standalone_quiz_attempt_is_graded_and_recorded() {
    let base = spawn_server().await;
    let owner = client_as("teacher-1");
    let learner = reqwest::Client::new();
    let content_id = create(&base, &owner, sample_quiz_payload()).await;
    let url = format!("{}/api/v1/content/{}/quiz-attempts", base, content_id);

    let (status, _) = post_json(&learner, url.clone(), json!({"student_name": "Lin", "answers": {"0": "a"}})).await;
    assert_eq!(status, 400);

    let (status, body) = post_json(
        &learner,
        url,
        json!({"student_name": "Lin", "answers": {"0": "a", "1": "c", "2": "a"}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["score"], 2);
    assert_eq!(body["questions"][1]["options"][2]["state"], "incorrectly_selected");
    assert_eq!(body["questions"][1]["options"][0]["state"], "correct");
    assert_eq!(body["questions"][1]["justification"], "Because a.");

    let submissions = wait_for_submissions(&base, &owner, &content_id, 1).await;
    assert!(submissions["items"][0].get("modules").is_none());

    let stranger = client_as("teacher-2")
        .get(format!("{}/api/v1/content/{}/submissions", base, content_id))
        .send()
        .await
        .unwrap();
    assert_eq!(stranger.status(), 403);
}

#[tokio::test]
async fn ai_generate_course_with_mock() {
    let base = spawn_server().await;
    let client = client_as("teacher-ai");

    let (status, body) = post_json(
        &client,
        format!("{}/api/v1/ai/generate-course", base),
        json!({
            "title": "Volcanoes",
            "selected_pages": "1-3",
            "extracted_text": "Volcanoes form where magma reaches the surface of the crust.",
            "difficulty": "easy",
            "num_modules": 2,
            "questions_per_module": 3,
            "include_module_summary": true
        }),
    )
    .await;
    assert_eq!(status, 201);
    assert_eq!(body["source"], "ai");
    assert_eq!(body["content"]["title"], "Volcanoes");
    assert_eq!(body["content"]["content"]["type"], "course");
    assert_eq!(body["content"]["content"]["data"]["modulos"].as_array().unwrap().len(), 2);

    let (status, body) = post_json(
        &client,
        format!("{}/api/v1/ai/generate-quiz", base),
        json!({"title": "", "extracted_text": "short", "difficulty": "easy", "num_questions": 0}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn communities_posts_and_comments() {
    let base = spawn_server().await;
    let owner = client_as("teacher-1");
    let member = client_as("student-1");
    let outsider = client_as("student-2");
    let content_id = create(&base, &owner, sample_quiz_payload()).await;

    let (status, _) = post_json(
        &owner,
        format!("{}/api/v1/communities", base),
        json!({"name": "ab", "visibility": "public"}),
    )
    .await;
    assert_eq!(status, 400);

    let (status, community) = post_json(
        &owner,
        format!("{}/api/v1/communities", base),
        json!({"name": "Biology 101", "description": "Weekly quizzes", "visibility": "public"}),
    )
    .await;
    assert_eq!(status, 201);
    assert_eq!(community["member_count"], 1);
    let cid = community["id"].as_str().unwrap().to_string();

    let (status, _) = post_json(&member, format!("{}/api/v1/communities/{}/join", base, cid), json!({})).await;
    assert_eq!(status, 200);
    let (status, _) = post_json(&member, format!("{}/api/v1/communities/{}/join", base, cid), json!({})).await;
    assert_eq!(status, 409);

    let (status, _) = post_json(
        &member,
        format!("{}/api/v1/communities/{}/posts", base, cid),
        json!({"content_id": content_id, "message": "not mine"}),
    )
    .await;
    assert_eq!(status, 403);

    let (status, post) = post_json(
        &owner,
        format!("{}/api/v1/communities/{}/posts", base, cid),
        json!({"content_id": content_id, "message": "Try this", "custom_author": "Prof. Reyes"}),
    )
    .await;
    assert_eq!(status, 201);
    let post_id = post["id"].as_str().unwrap().to_string();

    let (status, comment) = post_json(
        &member,
        format!("{}/api/v1/posts/{}/comments", base, post_id),
        json!({"text": "Great quiz"}),
    )
    .await;
    assert_eq!(status, 201);
    assert_eq!(comment["author_id"], "student-1");

    let feed = outsider
        .get(format!("{}/api/v1/communities/{}/posts", base, cid))
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(feed["total"], 1);
    assert_eq!(feed["items"][0]["content"]["title"], "Warm-up");
    assert_eq!(feed["items"][0]["comments"][0]["text"], "Great quiz");

    let shared = reqwest::Client::new()
        .get(format!("{}/api/v1/content/{}", base, content_id))
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(shared["custom_author"], "Prof. Reyes");

    let resp = owner
        .put(format!("{}/api/v1/communities/{}", base, cid))
        .json(&json!({"name": "Biology 101", "visibility": "private"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let hidden = outsider
        .get(format!("{}/api/v1/communities/{}/posts", base, cid))
        .send()
        .await
        .unwrap();
    assert_eq!(hidden.status(), 403);
    let listed = outsider
        .get(format!("{}/api/v1/communities", base))
        .send()
        .await
        .unwrap()
        .json::<serde_json::Value>()
        .await
        .unwrap();
    assert_eq!(listed["total"], 0);
}

async fn start_session(base: &str, client: &reqwest::Client, content_id: &str, name: &str) -> String {
    let (status, body) = post_json(
        client,
        format!("{}/api/v1/content/{}/course-sessions", base, content_id),
        json!({"student_name": name}),
    )
    .await;
    assert_eq!(status, 201);
    body["session_id"].as_str().unwrap().to_string()
}

async fn session_status(base: &str, client: &reqwest::Client, sid: &str) -> u16 {
    client
        .get(format!("{}/api/v1/course-sessions/{}", base, sid))
        .send()
        .await
        .unwrap()
        .status()
        .as_u16()
}

#[tokio::test]
async fn ending_a_course_session_releases_it() {
    let base = spawn_server().await;
    let owner = client_as("teacher-1");
    let learner = reqwest::Client::new();
    let content_id = create(&base, &owner, sample_course_payload()).await;
    let sid = start_session(&base, &learner, &content_id, "Ada").await;

    let url = format!("{}/api/v1/course-sessions/{}", base, sid);
    assert_eq!(learner.delete(&url).send().await.unwrap().status(), 204);
    assert_eq!(session_status(&base, &learner, &sid).await, 404);
    assert_eq!(learner.delete(&url).send().await.unwrap().status(), 404);
}

#[tokio::test]
async fn deleting_content_drops_its_course_sessions() {
    let base = spawn_server().await;
    let owner = client_as("teacher-1");
    let learner = reqwest::Client::new();
    let doomed = create(&base, &owner, sample_course_payload()).await;
    let kept = create(&base, &owner, sample_course_payload()).await;

    let mut doomed_sessions = Vec::new();
    for n in 0..20 {
        doomed_sessions.push(start_session(&base, &learner, &doomed, &format!("learner {n}")).await);
    }
    let survivor = start_session(&base, &learner, &kept, "Ada").await;

    let deleted = owner
        .delete(format!("{}/api/v1/content/{}", base, doomed))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    for sid in &doomed_sessions {
        assert_eq!(session_status(&base, &learner, sid).await, 404);
    }
    assert_eq!(session_status(&base, &learner, &survivor).await, 200);
}

#[tokio::test]
async fn stale_course_sessions_expire_on_next_start() {
    let base = spawn_server_with(Settings {
        course_session_ttl_secs: 1,
        ..Settings::default()
    })
    .await;
    let owner = client_as("teacher-1");
    let learner = reqwest::Client::new();
    let content_id = create(&base, &owner, sample_course_payload()).await;

    let stale = start_session(&base, &learner, &content_id, "Ada").await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let fresh = start_session(&base, &learner, &content_id, "Lin").await;

    assert_eq!(session_status(&base, &learner, &stale).await, 404);
    assert_eq!(session_status(&base, &learner, &fresh).await, 200);
}
