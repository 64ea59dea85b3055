use rocket::http::{ContentType, Status};

use crate::common::{WithCaller, create_group, poll_until, test_client};

#[test]
fn test_join_group() {
    let client = test_client();
    let group_id = create_group(&client, 1, "chat", "lobby", false, None);

    let res = client
        .post("/group/chat/lobby/join?role=member")
        .as_account(1, "4")
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["reply-to-class"], "chat");
    assert_eq!(body["reply-to"], group_id.to_string());

    // Joining twice conflicts.
    let res = client
        .post("/group/chat/lobby/join?role=member")
        .as_account(1, "4")
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
}

#[test]
fn test_join_missing_group() {
    let client = test_client();
    let res = client
        .post("/group/chat/nowhere/join")
        .as_account(1, "4")
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_clustered_join_spreads_clusters() {
    let client = test_client();
    let group_id = create_group(&client, 1, "chat", "big", true, Some(1));

    let res = client
        .post("/group/chat/big/join")
        .as_account(1, "6")
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["reply-to"], format!("{group_id}-0"));

    // Cluster size 1: the next participant spills into a new cluster.
    let res = client
        .post("/group/chat/big/join")
        .as_account(1, "7")
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["reply-to"], format!("{group_id}-1"));
}

#[test]
fn test_group_inbox() {
    let client = test_client();
    let group_id = create_group(&client, 1, "chat", "room", false, None);

    client
        .post("/group/chat/room/join")
        .as_account(1, "4")
        .dispatch();

    // Any sender may address the group stream.
    let res = client
        .post(format!("/send/chat/{group_id}"))
        .as_account(1, "9")
        .header(ContentType::JSON)
        .body(r#"{"message_type": "room", "payload": {"s": "all"}}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let uuid = body["uuid"].as_str().unwrap().to_string();

    assert!(poll_until(|| {
        client
            .get(format!("/message/{uuid}"))
            .as_account(1, "4")
            .dispatch()
            .status()
            == Status::Ok
    }));

    let res = client.get("/group/chat/room").as_account(1, "4").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["reply-to-class"], "chat");
    assert_eq!(body["reply-to"], group_id.to_string());
    assert_eq!(body["total-count"], 1);
    assert_eq!(body["messages"][0]["uuid"], uuid.as_str());
    assert_eq!(body["messages"][0]["payload"]["s"], "all");
}

#[test]
fn test_group_inbox_type_filter() {
    let client = test_client();
    let group_id = create_group(&client, 1, "chat", "typed", false, None);
    client
        .post("/group/chat/typed/join")
        .as_account(1, "4")
        .dispatch();

    let mut uuids = Vec::new();
    for kind in ["greeting", "alert"] {
        let res = client
            .post(format!("/send/chat/{group_id}"))
            .as_account(1, "9")
            .header(ContentType::JSON)
            .body(format!(r#"{{"message_type": "{kind}", "payload": {{}}}}"#))
            .dispatch();
        let body: serde_json::Value = res.into_json().unwrap();
        uuids.push(body["uuid"].as_str().unwrap().to_string());
    }
    for uuid in &uuids {
        assert!(poll_until(|| {
            client
                .get(format!("/message/{uuid}"))
                .as_account(1, "4")
                .dispatch()
                .status()
                == Status::Ok
        }));
    }

    let res = client
        .get("/group/chat/typed?type=alert")
        .as_account(1, "4")
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["total-count"], 1);
    assert_eq!(body["messages"][0]["type"], "alert");
}

#[test]
fn test_group_inbox_requires_participation() {
    let client = test_client();
    create_group(&client, 1, "chat", "closed", false, None);

    let res = client
        .get("/group/chat/closed")
        .as_account(1, "44")
        .dispatch();
    assert_eq!(res.status(), Status::NotAcceptable);
}

#[test]
fn test_group_inbox_missing_group() {
    let client = test_client();
    let res = client.get("/group/chat/ghost").as_account(1, "4").dispatch();
    assert_eq!(res.status(), Status::NotFound);
}
