use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use vantage_common::{
    Attribute, BinaryOp, EngineConfig, Expr, FieldSpec, GivenClause, Operation, OperationKind, Parameter,
    PrimitiveKind, Projection, Query, Schema, Service, Type, TypeRef,
};
use vantage_core::{QueryEngine, StubInvoker};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("🎬 Vantage film review example");

    // 1. Schema: films know their id, reviews live in another service.
    let schema = Schema::new(
        vec![
            Type::scalar("FilmId", PrimitiveKind::Int),
            Type::scalar("Title", PrimitiveKind::String),
            Type::scalar("ReviewText", PrimitiveKind::String),
            Type::scalar("Score", PrimitiveKind::Int),
            Type::model(
                "Film",
                vec![
                    Attribute::new("id", TypeRef::one("FilmId")).identity(),
                    Attribute::new("title", TypeRef::one("Title")),
                    Attribute::new("score", TypeRef::one("Score")),
                ],
            ),
            Type::model(
                "Review",
                vec![
                    Attribute::new("filmId", TypeRef::one("FilmId")).identity(),
                    Attribute::new("reviewText", TypeRef::one("ReviewText")),
                ],
            ),
        ],
        vec![Service::new(
            "ReviewService",
            vec![
                Operation::new("getReview", vec![Parameter::new("filmId", TypeRef::one("FilmId"))], TypeRef::one("Review")),
                Operation::new("getReviews", vec![Parameter::new("ids", TypeRef::many("FilmId"))], TypeRef::many("Review"))
                    .with_kind(OperationKind::Table),
            ],
        )],
    );

    // 2. Canned responses stand in for the remote service.
    let stub = Arc::new(StubInvoker::new(Arc::new(schema.clone())));
    stub.respond_with("ReviewService::getReviews", |args| {
        let ids = args[0].as_array().cloned().unwrap_or_default();
        Ok(json!(ids
            .iter()
            .filter(|id| id.as_i64() != Some(3))
            .map(|id| json!({ "filmId": id, "reviewText": format!("Review of film {}", id) }))
            .collect::<Vec<_>>()))
    });
    stub.respond_with("ReviewService::getReview", |args| {
        Ok(json!({ "filmId": args[0], "reviewText": format!("Late review of film {}", args[0]) }))
    });

    let config = EngineConfig::load().unwrap_or_default();
    let engine = QueryEngine::new(schema, config).with_invoker(stub.clone());

    // 3. find { Film[] } as { title, review, boosted: score + 1 }[]
    let query = Query::find(TypeRef::many("Film"))
        .given(GivenClause::argument("films", TypeRef::many("Film")))
        .project(
            Projection::shape(vec![
                FieldSpec::discover("title", TypeRef::one("Title")),
                FieldSpec::discover("review", TypeRef::one("ReviewText")),
                FieldSpec::expression(
                    "boosted",
                    TypeRef::one("lang.Int"),
                    Expr::binary(BinaryOp::Add, Expr::attr("score"), Expr::literal(1)),
                ),
            ])
            .collection(),
        );
    let arguments = HashMap::from([(
        "films".to_string(),
        json!([
            { "id": 1, "title": "Alien", "score": 8 },
            { "id": 2, "title": "Heat", "score": 7 },
            { "id": 3, "title": "Ran", "score": 9 }
        ]),
    )]);

    let mut result = engine.query(query, arguments).await?;
    while let Some(item) = result.next().await {
        let value = item?;
        println!("  {}", value.to_json());
        if let Some(review) = value.attribute("review") {
            for call in result.lineage().remote_calls(review.source) {
                println!("    ↳ {}::{} {} ({}ms)", call.service, call.operation, call.request, call.duration_ms);
            }
        }
    }

    // 4. Statistics
    let stats = result.statistics();
    println!("📊 {}", serde_json::to_string_pretty(&stats)?);
    println!("Calls made: {:?}", stub.calls().iter().map(|c| c.operation.as_str()).collect::<Vec<_>>());

    Ok(())
}
