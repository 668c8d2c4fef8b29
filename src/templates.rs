//! Built-in artifact templates for common stacks.
//!
//! A hit here answers a request immediately, no job and no LLM call.

use crate::job::DevOpsFiles;

struct StackTemplate {
    dockerfile: &'static str,
    port: u16,
    /// Extra `environment:` entries and volumes for the compose service.
    environment: &'static [&'static str],
    volumes: &'static [&'static str],
}

const PYTHON: StackTemplate = StackTemplate {
    dockerfile: r#"FROM python:3.11-slim AS builder
WORKDIR /app
RUN apt-get update && apt-get install -y --no-install-recommends build-essential \
    && rm -rf /var/lib/apt/lists/*
COPY requirements.txt .
RUN pip install --no-cache-dir --user -r requirements.txt

FROM python:3.11-slim
WORKDIR /app
RUN useradd -m -u 1000 appuser && chown -R appuser:appuser /app
COPY --from=builder /root/.local /home/appuser/.local
COPY --chown=appuser:appuser . .
ENV PATH=/home/appuser/.local/bin:$PATH
USER appuser
EXPOSE 8000
CMD ["python", "app.py"]
"#,
    port: 8000,
    environment: &["PYTHONUNBUFFERED=1"],
    volumes: &[".:/app", "/app/.venv"],
};

const NODEJS: StackTemplate = StackTemplate {
    dockerfile: r#"FROM node:20-alpine AS builder
WORKDIR /app
COPY package*.json ./
RUN npm ci --omit=dev && npm cache clean --force

FROM node:20-alpine
WORKDIR /app
RUN addgroup -g 1001 -S nodejs && adduser -S nodejs -u 1001
COPY --from=builder /app/node_modules ./node_modules
COPY --chown=nodejs:nodejs . .
USER nodejs
EXPOSE 3000
HEALTHCHECK --interval=30s --timeout=3s --start-period=5s --retries=3 \
  CMD node -e "require('http').get('http://localhost:3000/health', r => process.exit(r.statusCode === 200 ? 0 : 1))" || exit 1
CMD ["node", "index.js"]
"#,
    port: 3000,
    environment: &["NODE_ENV=development"],
    volumes: &[".:/app", "/app/node_modules"],
};

const GOLANG: StackTemplate = StackTemplate {
    dockerfile: r#"FROM golang:1.21-alpine AS builder
WORKDIR /app
RUN apk add --no-cache git
COPY go.mod go.sum ./
RUN go mod download
COPY . .
RUN CGO_ENABLED=0 GOOS=linux go build -o main .

FROM alpine:latest
RUN apk --no-cache add ca-certificates tzdata
WORKDIR /app
RUN addgroup -g 1001 appuser && adduser -D -u 1001 -G appuser appuser
COPY --from=builder --chown=appuser:appuser /app/main .
USER appuser
EXPOSE 8080
CMD ["./main"]
"#,
    port: 8080,
    environment: &["CGO_ENABLED=0"],
    volumes: &[],
};

const RUST: StackTemplate = StackTemplate {
    dockerfile: r#"FROM rust:1.75-alpine AS builder
WORKDIR /app
RUN apk add --no-cache musl-dev
COPY Cargo.toml Cargo.lock ./
RUN mkdir src && echo "fn main() {}" > src/main.rs && cargo build --release && rm src/main.rs
COPY . .
RUN touch src/main.rs && cargo build --release

FROM alpine:latest
RUN apk --no-cache add ca-certificates
WORKDIR /app
RUN addgroup -g 1001 appuser && adduser -D -u 1001 -G appuser appuser
# Replace `your-binary-name` with the binary name from Cargo.toml.
COPY --from=builder --chown=appuser:appuser /app/target/release/your-binary-name ./app
USER appuser
EXPOSE 8080
CMD ["./app"]
"#,
    port: 8080,
    environment: &[],
    volumes: &[],
};

const JAVA: StackTemplate = StackTemplate {
    dockerfile: r#"FROM maven:3.9-eclipse-temurin-21 AS builder
WORKDIR /app
COPY pom.xml .
RUN mvn dependency:go-offline -B
COPY src ./src
RUN mvn clean package -DskipTests

FROM eclipse-temurin:21-jre-alpine
WORKDIR /app
RUN addgroup -g 1001 appuser && adduser -D -u 1001 -G appuser appuser
COPY --from=builder /app/target/*.jar app.jar
RUN chown appuser:appuser app.jar
USER appuser
EXPOSE 8080
ENTRYPOINT ["java", "-jar", "app.jar"]
"#,
    port: 8080,
    environment: &["JAVA_OPTS=-Xmx512m"],
    volumes: &[],
};

/// Shared by every stack: build the image and push it to GHCR.
const CI_PIPELINE: &str = r#"name: CI/CD Pipeline

on:
  push:
    branches: [ main, master ]
  pull_request:
    branches: [ main, master ]

jobs:
  build-and-push:
    runs-on: ubuntu-latest
    permissions:
      contents: read
      packages: write

    steps:
    - name: Checkout code
      uses: actions/checkout@v4

    - name: Set up Docker Buildx
      uses: docker/setup-buildx-action@v3

    - name: Log in to GitHub Container Registry
      uses: docker/login-action@v3
      with:
        registry: ghcr.io
        username: ${{ github.actor }}
        password: ${{ secrets.GITHUB_TOKEN }}

    - name: Extract metadata
      id: meta
      uses: docker/metadata-action@v5
      with:
        images: ghcr.io/${{ github.repository }}
        tags: |
          type=ref,event=branch
          type=ref,event=pr
          type=semver,pattern={{version}}
          type=sha

    - name: Build and push Docker image
      uses: docker/build-push-action@v5
      with:
        context: .
        push: true
        tags: ${{ steps.meta.outputs.tags }}
        labels: ${{ steps.meta.outputs.labels }}
        cache-from: type=gha
        cache-to: type=gha,mode=max
"#;

impl StackTemplate {
    fn compose(&self) -> String {
        let mut out = format!(
            "services:\n  app:\n    build:\n      context: .\n      dockerfile: Dockerfile\n    ports:\n      - \"{port}:{port}\"\n",
            port = self.port
        );
        if !self.volumes.is_empty() {
            out.push_str("    volumes:\n");
            for volume in self.volumes {
                out.push_str(&format!("      - {volume}\n"));
            }
        }
        if !self.environment.is_empty() {
            out.push_str("    environment:\n");
            for var in self.environment {
                out.push_str(&format!("      - {var}\n"));
            }
        }
        out.push_str("    restart: unless-stopped\n");
        out
    }

    fn files(&self) -> DevOpsFiles {
        DevOpsFiles {
            dockerfile: Some(self.dockerfile.to_string()),
            compose: Some(self.compose()),
            github_action: Some(CI_PIPELINE.to_string()),
        }
    }
}

/// Stack names with a built-in template.
pub const KNOWN_STACKS: &[&str] = &[
    "python",
    "nodejs",
    "golang",
    "rust",
    "java_maven",
    "java_gradle",
];

/// Ready-made artifacts for `stack` (case-insensitive), or `None`.
pub fn get_template(stack: &str) -> Option<DevOpsFiles> {
    let template = match stack.trim().to_lowercase().as_str() {
        "python" => &PYTHON,
        "nodejs" => &NODEJS,
        "golang" => &GOLANG,
        "rust" => &RUST,
        "java_maven" | "java_gradle" => &JAVA,
        _ => return None,
    };
    Some(template.files())
}
