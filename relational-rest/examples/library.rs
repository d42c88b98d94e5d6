use clap::Parser;
use relational_rest::{
    filters::LIMIT,
    orm::mock::{Database, Model, Schema},
    prelude::*,
    validation::Matches,
};
use serde_json::json;
use std::sync::Arc;
use url::Url;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Schema
//

pub fn schema() -> Schema {
    Schema::new()
        .model(
            Model::new("author")
                .scalar("name", ValueType::Text)
                .scalar("born", ValueType::Int)
                .reverse("books", "book", "author", true),
        )
        .model(
            Model::new("book")
                .scalar("title", ValueType::Text)
                .scalar("published", ValueType::DateTime)
                .foreign_key("author", "author", true)
                .through("pages", "page", "book"),
        )
        .model(
            Model::new("page")
                .scalar("number", ValueType::Int)
                .scalar("text", ValueType::Text)
                .foreign_key("book", "book", false),
        )
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// API
//

#[derive(Clone, Debug, Parser)]
pub struct Options {
    /// Absolute URI under which the API is served.
    #[clap(
        long,
        env = "LIBRARY_BASE_URI",
        default_value = "http://localhost:8000/api"
    )]
    base_uri: Url,
}

pub fn api(opt: &Options, db: &Database) -> Result<Arc<Api>> {
    Api::builder()
        .config(ApiConfig::default().with_base_uri(opt.base_uri.path()))
        .class(
            ModelResourceClass::new("author")
                .field(AttributeField::new("name", ValueType::Text).validator(Required))
                .field(AttributeField::new("born", ValueType::Int).optional())
                .field(IterableField::new("books", "book").optional().read_only())
                .annotate("book_count", Aggregate::Count("books".into()))
                .field(AttributeField::new("book_count", ValueType::Int).read_only()),
        )
        .class(
            ModelResourceClass::new("book")
                .field(AttributeField::new("title", ValueType::Text).validator(Length::between(1, 100)))
                .field(AttributeField::new("published", ValueType::DateTime).optional())
                .field(URIResourceField::new("author", "author"))
                .field(
                    IterableField::new("pages", "page")
                        .optional()
                        .natural_key(["number"]),
                ),
        )
        .class(
            ModelResourceClass::new("page")
                .field(AttributeField::new("number", ValueType::Int).validator(Range::between(1.0, 10_000.0)))
                .field(
                    AttributeField::new("text", ValueType::Text).validator(
                        Matches::new(r"\S").map_err(Error::invalid_configuration)?,
                    ),
                ),
        )
        .collection(
            Collection::new("authors", db.queryset("author"), "author")
                .filter(ParameterizedFilter::new("born_after", "born__gt").order_by(["born"])),
        )
        .collection(
            Collection::new("books", db.queryset("book"), "book")
                .page_size(2)
                .filter(ParameterizedFilter::new("author", "author__name__iexact"))
                .filter(StandardFilter::new("first").predicate(LIMIT, 1)),
        )
        .build()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Test data
//

pub async fn create_db() -> Database {
    let db = Database::create(schema());
    for (name, born) in [("Jeff", 1975), ("Annie", 2000), ("Abed", 2001)] {
        db.insert(
            "author",
            [
                ("name", Attr::Value(name.into())),
                ("born", Attr::Value(born.into())),
            ],
        )
        .await
        .unwrap();
    }
    db
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Requests
//

async fn show(api: &Arc<Api>, request: Request) {
    println!("> {} {}", request.method, request.path);
    if let Some(body) = &request.body {
        println!("> {}", serde_json::to_string(body).unwrap());
    }
    match api.handle(request).await {
        Ok(response) => {
            println!("< {}", response.status.code());
            for (name, value) in &response.headers {
                println!("< {name}: {value}");
            }
            if let Some(body) = &response.body {
                let mut out = vec![];
                api.formatter().write_to(body, &mut out).unwrap();
                println!("< {}", String::from_utf8_lossy(&out));
            }
        }
        Err(err) => println!("< {} {err}", err.status()),
    }
    println!();
}

fn payload(json: &str, api: &Api) -> Mapping {
    api.formatter().read_from(&mut json.as_bytes()).unwrap()
}

#[async_std::main]
async fn main() {
    relational_rest::init_logging();

    let opt = Options::parse();
    let db = create_db().await;
    let api = api(&opt, &db).unwrap();
    // Join relative paths beneath the base URI, not beside its last segment.
    let base = Url::parse(&format!("{}/", opt.base_uri.as_str().trim_end_matches('/'))).unwrap();
    let uri = |path: &str| base.join(path).unwrap().to_string();

    show(&api, Request::get(&uri(""))).await;
    show(&api, Request::get(&uri("authors?bornAfter=1999"))).await;
    show(
        &api,
        Request::post(
            &uri("books"),
            payload(
                &json!({
                    "title": "Studyology",
                    "published": "2019-09-01T00:00:00Z",
                    "author": uri("authors/2"),
                    "pages": [
                        {"number": 1, "text": "Sample text about studies"},
                        {"number": 2, "text": "More about studies"},
                    ],
                })
                .to_string(),
                &api,
            ),
        ),
    )
    .await;
    show(
        &api,
        Request::put(
            &uri("books/1"),
            payload(
                &json!({
                    "title": "Studyology",
                    "author": uri("authors/2"),
                    "pages": [{"number": 2, "text": "Rewritten"}],
                })
                .to_string(),
                &api,
            ),
        ),
    )
    .await;
    show(
        &api,
        Request::post(&uri("books"), payload(&json!({"title": "", "author": uri("authors/9")}).to_string(), &api)),
    )
    .await;
    show(&api, Request::get(&uri("books?author=annie"))).await;
    show(&api, Request::get(&uri("authors/2"))).await;
    show(&api, Request::delete(&uri("books"))).await;
}
